//! OCSP revocation checks for pki-mode peers
//!
//! The control plane asks the issuing CA's responder about each data
//! plane's leaf certificate before admitting the session. The DER codec
//! here is the minimal slice of RFC 6960 this check needs: a single-cert
//! request with a SHA-256 `CertID`, and a walk of the basic response down
//! to the leaf's cert status. Response signatures are not validated; the
//! verdict only ever tightens what mutual TLS already established.

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_rustls::rustls::pki_types::CertificateDer;
use x509_parser::prelude::{FromDer, GeneralName, ParsedExtension, X509Certificate};

use crate::OCSP_TIMEOUT;

/// OCSP errors
#[derive(Debug, Error)]
pub enum OcspError {
    #[error("unknown OCSP policy: {0:?} (expected \"on\", \"off\", or \"optional\")")]
    UnknownPolicy(String),
    #[error("certificate parse error: {0}")]
    Cert(String),
    #[error("no OCSP responder URL in certificate")]
    NoResponder,
    #[error("OCSP transport error: {0}")]
    Transport(String),
    #[error("malformed OCSP response: {0}")]
    Malformed(&'static str),
}

/// Whether revocation is checked and how failures are treated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OcspPolicy {
    /// Check; any failure refuses the connection.
    On,
    /// Never check.
    Off,
    /// Check; soft failures are logged and the connection proceeds.
    /// A definitive revocation still refuses it.
    Optional,
}

impl std::str::FromStr for OcspPolicy {
    type Err = OcspError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on" => Ok(Self::On),
            "off" => Ok(Self::Off),
            "optional" => Ok(Self::Optional),
            other => Err(OcspError::UnknownPolicy(other.to_string())),
        }
    }
}

/// What the responder said about the leaf.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OcspVerdict {
    Good,
    Revoked,
    /// The status could not be established (transport trouble, responder
    /// errors, unknown certificate).
    Unverified(String),
}

/// id-ad-ocsp
const OID_ACCESS_OCSP: &str = "1.3.6.1.5.5.7.48.1";
/// id-pkix-ocsp-basic, DER content octets
const OID_OCSP_BASIC: &[u8] = &[0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x30, 0x01, 0x01];
/// sha256, DER content octets
const OID_SHA256: &[u8] = &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01];

/// OCSP client over plain HTTP POST.
pub struct OcspClient {
    http: reqwest::Client,
}

impl OcspClient {
    pub fn new() -> Result<Self, OcspError> {
        let http = reqwest::Client::builder()
            .timeout(OCSP_TIMEOUT)
            .build()
            .map_err(|e| OcspError::Transport(e.to_string()))?;
        Ok(Self { http })
    }

    /// Query the leaf's responder. `chain[0]` is the peer leaf; the next
    /// entry, when present, acts as its issuer.
    pub async fn check(&self, chain: &[CertificateDer<'_>]) -> Result<OcspVerdict, OcspError> {
        let leaf = chain
            .first()
            .ok_or(OcspError::Malformed("empty certificate chain"))?;
        let issuer = chain.get(1).unwrap_or(leaf);

        let responder = responder_url(leaf.as_ref())?;
        let request = build_request(leaf.as_ref(), issuer.as_ref())?;

        let response = self
            .http
            .post(&responder)
            .header("content-type", "application/ocsp-request")
            .body(request)
            .send()
            .await
            .map_err(|e| OcspError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(OcspError::Transport(format!(
                "responder returned HTTP {}",
                response.status()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| OcspError::Transport(e.to_string()))?;

        parse_response(&body)
    }
}

/// Locate the OCSP responder URL in the certificate's
/// authority-information-access extension.
pub fn responder_url(leaf_der: &[u8]) -> Result<String, OcspError> {
    let (_, cert) =
        X509Certificate::from_der(leaf_der).map_err(|e| OcspError::Cert(e.to_string()))?;

    for ext in cert.extensions() {
        if let ParsedExtension::AuthorityInfoAccess(aia) = ext.parsed_extension() {
            for desc in &aia.accessdescs {
                if desc.access_method.to_id_string() == OID_ACCESS_OCSP {
                    if let GeneralName::URI(uri) = &desc.access_location {
                        return Ok(uri.to_string());
                    }
                }
            }
        }
    }
    Err(OcspError::NoResponder)
}

/// Build a single-certificate OCSPRequest with a SHA-256 CertID.
pub fn build_request(leaf_der: &[u8], issuer_der: &[u8]) -> Result<Vec<u8>, OcspError> {
    let (_, leaf) =
        X509Certificate::from_der(leaf_der).map_err(|e| OcspError::Cert(e.to_string()))?;
    let (_, issuer) =
        X509Certificate::from_der(issuer_der).map_err(|e| OcspError::Cert(e.to_string()))?;

    let issuer_name_hash = Sha256::digest(leaf.tbs_certificate.issuer.as_raw());
    let issuer_key_hash = Sha256::digest(
        issuer
            .tbs_certificate
            .subject_pki
            .subject_public_key
            .data
            .as_ref(),
    );

    let mut algorithm = der_tlv(0x06, OID_SHA256);
    algorithm.extend_from_slice(&[0x05, 0x00]);

    // CertID ::= SEQUENCE { hashAlgorithm, issuerNameHash, issuerKeyHash,
    // serialNumber }
    let mut inner = Vec::new();
    inner.extend(der_tlv(0x30, &algorithm));
    inner.extend(der_tlv(0x04, &issuer_name_hash));
    inner.extend(der_tlv(0x04, &issuer_key_hash));
    inner.extend(der_tlv(0x02, leaf.raw_serial()));
    let cert_id = der_tlv(0x30, &inner);

    // Request -> requestList -> TBSRequest -> OCSPRequest, all
    // single-element sequences.
    let request = der_tlv(0x30, &cert_id);
    let request_list = der_tlv(0x30, &request);
    let tbs_request = der_tlv(0x30, &request_list);
    Ok(der_tlv(0x30, &tbs_request))
}

/// Walk an OCSPResponse down to the first SingleResponse's cert status.
pub fn parse_response(bytes: &[u8]) -> Result<OcspVerdict, OcspError> {
    let mut outer = DerReader::new(bytes);
    let response = outer.expect(0x30, "OCSPResponse")?;

    let mut response = DerReader::new(response);
    let status = response.expect(0x0a, "responseStatus")?;
    if status.len() != 1 {
        return Err(OcspError::Malformed("responseStatus"));
    }
    if status[0] != 0 {
        return Ok(OcspVerdict::Unverified(format!(
            "responder status {}",
            status[0]
        )));
    }

    let response_bytes = response.expect(0xa0, "responseBytes")?;
    let mut response_bytes = DerReader::new(response_bytes);
    let wrapper = response_bytes.expect(0x30, "ResponseBytes")?;
    let mut wrapper = DerReader::new(wrapper);
    let response_type = wrapper.expect(0x06, "responseType")?;
    if response_type != OID_OCSP_BASIC {
        return Ok(OcspVerdict::Unverified(
            "unsupported response type".to_string(),
        ));
    }
    let basic = wrapper.expect(0x04, "response octets")?;

    let mut basic = DerReader::new(basic);
    let basic_response = basic.expect(0x30, "BasicOCSPResponse")?;
    let mut basic_response = DerReader::new(basic_response);
    let tbs = basic_response.expect(0x30, "tbsResponseData")?;

    let mut tbs = DerReader::new(tbs);
    let mut tag = tbs.read()?.0;
    // optional [0] version
    if tag == 0xa0 {
        tag = tbs.read()?.0;
    }
    // responderID is [1] byName or [2] byKey
    if tag != 0xa1 && tag != 0xa2 {
        return Err(OcspError::Malformed("responderID"));
    }
    if tbs.read()?.0 != 0x18 {
        return Err(OcspError::Malformed("producedAt"));
    }
    let responses = tbs.expect(0x30, "responses")?;

    let mut responses = DerReader::new(responses);
    let single = responses.expect(0x30, "SingleResponse")?;
    let mut single = DerReader::new(single);
    let _cert_id = single.expect(0x30, "certID")?;
    let (status_tag, _) = single.read()?;
    match status_tag {
        0x80 => Ok(OcspVerdict::Good),
        0xa1 => Ok(OcspVerdict::Revoked),
        0x82 => Ok(OcspVerdict::Unverified(
            "certificate unknown to the responder".to_string(),
        )),
        _ => Err(OcspError::Malformed("certStatus")),
    }
}

/// Encode one DER TLV with definite length.
fn der_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
        let significant = &bytes[first..];
        out.push(0x80 | significant.len() as u8);
        out.extend_from_slice(significant);
    }
    out.extend_from_slice(content);
    out
}

/// Sequential reader over DER TLVs.
struct DerReader<'a> {
    input: &'a [u8],
}

impl<'a> DerReader<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { input }
    }

    fn read(&mut self) -> Result<(u8, &'a [u8]), OcspError> {
        if self.input.len() < 2 {
            return Err(OcspError::Malformed("truncated"));
        }
        let tag = self.input[0];
        let (len, header) = if self.input[1] < 0x80 {
            (self.input[1] as usize, 2)
        } else {
            let n = (self.input[1] & 0x7f) as usize;
            if n == 0 || n > 4 || self.input.len() < 2 + n {
                return Err(OcspError::Malformed("length"));
            }
            let mut len = 0usize;
            for byte in &self.input[2..2 + n] {
                len = (len << 8) | *byte as usize;
            }
            (len, 2 + n)
        };
        if self.input.len() < header + len {
            return Err(OcspError::Malformed("truncated"));
        }
        let content = &self.input[header..header + len];
        self.input = &self.input[header + len..];
        Ok((tag, content))
    }

    fn expect(&mut self, tag: u8, what: &'static str) -> Result<&'a [u8], OcspError> {
        let (got, content) = self.read()?;
        if got != tag {
            return Err(OcspError::Malformed(what));
        }
        Ok(content)
    }
}
