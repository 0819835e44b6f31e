use std::error::Error;

use chrono::Utc;
use sha2::{Digest, Sha256};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::local_ca::LocalCa;
use crate::util::der;

/// id-pkix-ocsp-basic
const OID_OCSP_BASIC: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 48, 1, 1];
/// sha256WithRSAEncryption
const OID_SHA256_RSA: &[u64] = &[1, 2, 840, 113549, 1, 1, 11];
/// id-sha256
const OID_SHA256: &[u64] = &[2, 16, 840, 1, 101, 3, 4, 2, 1];

/// CRLReason keyCompromise
const REASON_KEY_COMPROMISE: u8 = 1;

/// Decides whether a certificate counts as revoked: any DNS name in its SAN
/// carrying `revoked` as a full label, where both `.` and `--` separate
/// labels.
pub fn is_revoked_domain(domain: &str) -> bool {
  domain.split('.').flat_map(|label| label.split("--")).any(|segment| segment == "revoked")
}

fn generalized_time_now() -> Vec<u8> {
  der::generalized_time(&Utc::now().format("%Y%m%d%H%M%SZ").to_string())
}

fn sha256_algorithm_identifier() -> Vec<u8> {
  der::sequence(&[&der::oid(OID_SHA256), &der::null()])
}

/// Builds a signed OCSP response for the given leaf certificate.
///
/// The response is `revoked` (reason keyCompromise, revocation time now) when
/// the leaf's SAN carries the `revoked` token, and `good` otherwise. It is a
/// BasicOCSPResponse signed by the CA key under SHA-256/RSA with the CA
/// certificate included.
pub fn ocsp_response_for(ca: &LocalCa, leaf_der: &[u8]) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
  let (tbs_response_data, _) = build_response_data(ca, leaf_der)?;
  let signature = ca.sign_with_ca_key(&tbs_response_data);

  let basic_response = der::sequence(&[
    &tbs_response_data,
    &der::sequence(&[&der::oid(OID_SHA256_RSA), &der::null()]),
    &der::bit_string(&signature),
    &der::explicit(0, &der::sequence(&[ca.ca_cert_der()])),
  ]);

  // OCSPResponse: successful(0) with the basic response in responseBytes
  Ok(der::sequence(&[
    &der::enumerated(0),
    &der::explicit(0, &der::sequence(&[&der::oid(OID_OCSP_BASIC), &der::octet_string(&basic_response)])),
  ]))
}

/// Builds the to-be-signed ResponseData, returning it together with the
/// revocation verdict.
fn build_response_data(ca: &LocalCa, leaf_der: &[u8]) -> Result<(Vec<u8>, bool), Box<dyn Error + Send + Sync>> {
  let (_, leaf) = X509Certificate::from_der(leaf_der)?;
  let (_, ca_cert) = X509Certificate::from_der(ca.ca_cert_der())?;

  let revoked = leaf
    .subject_alternative_name()?
    .map(|san| {
      san.value.general_names.iter().any(|name| match name {
        x509_parser::extensions::GeneralName::DNSName(dns) => is_revoked_domain(dns),
        _ => false,
      })
    })
    .unwrap_or(false);

  let issuer_name_hash = Sha256::digest(ca_cert.subject().as_raw());
  let issuer_key_hash = Sha256::digest(&ca_cert.public_key().subject_public_key.data);

  let cert_id = der::sequence(&[
    &sha256_algorithm_identifier(),
    &der::octet_string(&issuer_name_hash),
    &der::octet_string(&issuer_key_hash),
    &der::integer(leaf.raw_serial()),
  ]);

  let cert_status = if revoked {
    // revoked [1] IMPLICIT: revocationTime and an explicit revocationReason
    let revocation_info = [
      generalized_time_now(),
      der::explicit(0, &der::enumerated(REASON_KEY_COMPROMISE)),
    ]
    .concat();
    der::tlv(0xa1, &revocation_info)
  } else {
    // good [0] IMPLICIT NULL
    der::tlv(0x80, &[])
  };

  let single_response = der::sequence(&[&cert_id, &cert_status, &generalized_time_now()]);

  let response_data = der::sequence(&[
    // responderID [1]: byName, the CA subject
    &der::explicit(1, ca_cert.subject().as_raw()),
    &generalized_time_now(),
    &der::sequence(&[&single_response]),
  ]);

  Ok((response_data, revoked))
}
