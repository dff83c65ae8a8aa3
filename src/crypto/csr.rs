use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType};
use tracing::debug;

use crate::domain::SubjectInfo;
use crate::error::Error;
use crate::types::{KeyAlgorithm, Result};

/// Fresh key pair and the CSR signed with it
pub struct GeneratedCsr {
    /// PEM-encoded PKCS#10 request
    pub csr_pem: String,
    /// PEM-encoded PKCS#8 private key
    pub private_key_pem: String,
    pub key_algorithm: KeyAlgorithm,
}

/// Generate a new key pair and a CSR covering every domain.
///
/// The first domain becomes the common name; all domains are SANs.
pub fn generate_csr(domains: &[String], subject: &SubjectInfo, algorithm: KeyAlgorithm) -> Result<GeneratedCsr> {
    let common_name = domains
        .first()
        .ok_or_else(|| Error::InvalidRequest("CSR requires at least one domain".into()))?;

    debug!(domains = domains.len(), algorithm = %algorithm, "Generating key pair and CSR");

    let mut params = CertificateParams::new(domains.to_vec());
    params.alg = match algorithm {
        KeyAlgorithm::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
        KeyAlgorithm::EcdsaP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
    };

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name.as_str());
    if let Some(organization) = &subject.organization {
        dn.push(DnType::OrganizationName, organization.as_str());
    }
    if let Some(country) = &subject.country {
        dn.push(DnType::CountryName, country.as_str());
    }
    if let Some(state) = &subject.state {
        dn.push(DnType::StateOrProvinceName, state.as_str());
    }
    if let Some(locality) = &subject.locality {
        dn.push(DnType::LocalityName, locality.as_str());
    }
    params.distinguished_name = dn;

    let cert = Certificate::from_params(params)?;
    let csr_pem = cert.serialize_request_pem()?;
    let private_key_pem = cert.serialize_private_key_pem();

    Ok(GeneratedCsr {
        csr_pem,
        private_key_pem,
        key_algorithm: algorithm,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_csr() {
        let domains = vec!["example.com".to_string(), "www.example.com".to_string()];
        let subject = SubjectInfo {
            organization: Some("Example Org".into()),
            country: Some("US".into()),
            ..Default::default()
        };

        let generated = generate_csr(&domains, &subject, KeyAlgorithm::EcdsaP256).unwrap();
        assert!(generated.csr_pem.starts_with("-----BEGIN CERTIFICATE REQUEST-----"));
        assert!(generated.private_key_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn test_each_csr_has_a_fresh_key() {
        let domains = vec!["*.example.com".to_string()];
        let first = generate_csr(&domains, &SubjectInfo::default(), KeyAlgorithm::EcdsaP384).unwrap();
        let second = generate_csr(&domains, &SubjectInfo::default(), KeyAlgorithm::EcdsaP384).unwrap();
        assert_ne!(first.private_key_pem, second.private_key_pem);
    }

    #[test]
    fn test_generate_csr_requires_domain() {
        assert!(generate_csr(&[], &SubjectInfo::default(), KeyAlgorithm::EcdsaP256).is_err());
    }
}
