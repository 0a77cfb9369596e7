#![deny(unsafe_code)]
//! Certificate material for the secure session
//!
//! Material is loaded in full before the socket is created. DER is used
//! as-is; PEM (feature `pem`) is de-armoured into a fixed-capacity buffer.
//! Either way the result must be exactly one well-formed top-level ASN.1
//! SEQUENCE, which is what certificates and private keys are.

use hal_abstractions::SocketError;

/// Largest decoded PEM object accepted
#[cfg(feature = "pem")]
pub const MAX_PEM_DER_LEN: usize = 4096;

#[cfg(feature = "pem")]
const MAX_PEM_BODY_LEN: usize = (MAX_PEM_DER_LEN / 3 + 1) * 4;

const ASN1_SEQUENCE: u8 = 0x30;

/// Encoding of the material in a [`CertificateBundle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CertificateFormat {
    #[default]
    Der,
    #[cfg(feature = "pem")]
    Pem,
}

/// Raw certificate material as supplied by the application
#[derive(Debug, Clone, Copy, Default)]
pub struct CertificateBundle<'a> {
    pub format: CertificateFormat,
    /// Trust anchor for the server certificate
    pub ca_cert: Option<&'a [u8]>,
    /// Client certificate for mutual authentication
    pub client_cert: Option<&'a [u8]>,
    /// Private key matching `client_cert`
    pub client_key: Option<&'a [u8]>,
}

impl<'a> CertificateBundle<'a> {
    /// Bundle holding only a DER trust anchor
    pub fn ca_der(ca_cert: &'a [u8]) -> Self {
        Self {
            ca_cert: Some(ca_cert),
            ..Self::default()
        }
    }
}

/// One parsed object
#[derive(Debug, Clone)]
pub enum Certificate<'a> {
    Der(&'a [u8]),
    #[cfg(feature = "pem")]
    Decoded(heapless::Vec<u8, MAX_PEM_DER_LEN>),
}

impl Certificate<'_> {
    pub fn as_der(&self) -> &[u8] {
        match self {
            Self::Der(der) => der,
            #[cfg(feature = "pem")]
            Self::Decoded(der) => der,
        }
    }
}

/// Parsed certificate material owned by a secure session
#[derive(Debug, Clone, Default)]
pub struct Credentials<'a> {
    pub ca_cert: Option<Certificate<'a>>,
    pub client_cert: Option<Certificate<'a>>,
    pub client_key: Option<Certificate<'a>>,
}

impl<'a> Credentials<'a> {
    /// Parse and sanity check a bundle
    ///
    /// # Errors
    ///
    /// `SocketError::TlsCertificateError` if any object is malformed, or if
    /// only one of client certificate and client key is present.
    pub fn parse(bundle: &CertificateBundle<'a>) -> Result<Self, SocketError> {
        if bundle.client_cert.is_some() != bundle.client_key.is_some() {
            error!("Client certificate and key must be supplied together");
            return Err(SocketError::TlsCertificateError);
        }

        Ok(Self {
            ca_cert: parse_object(bundle.format, bundle.ca_cert)?,
            client_cert: parse_object(bundle.format, bundle.client_cert)?,
            client_key: parse_object(bundle.format, bundle.client_key)?,
        })
    }

    pub fn has_client_auth(&self) -> bool {
        self.client_cert.is_some()
    }
}

fn parse_object(
    format: CertificateFormat,
    data: Option<&[u8]>,
) -> Result<Option<Certificate<'_>>, SocketError> {
    let Some(data) = data else {
        return Ok(None);
    };

    let cert = match format {
        CertificateFormat::Der => Certificate::Der(data),
        #[cfg(feature = "pem")]
        CertificateFormat::Pem => Certificate::Decoded(decode_pem(data)?),
    };

    check_der(cert.as_der())?;
    Ok(Some(cert))
}

/// Check that `der` is a single definite-length SEQUENCE
pub fn check_der(der: &[u8]) -> Result<(), SocketError> {
    if der.len() < 2 || der[0] != ASN1_SEQUENCE {
        warn!("Certificate material is not an ASN.1 SEQUENCE");
        return Err(SocketError::TlsCertificateError);
    }

    let (header_len, body_len) = match der[1] {
        len @ 0..=0x7F => (2, len as usize),
        // Long form: low bits give the number of length octets
        0x81..=0x83 => {
            let octets = (der[1] & 0x7F) as usize;
            if der.len() < 2 + octets {
                return Err(SocketError::TlsCertificateError);
            }
            let len = der[2..2 + octets]
                .iter()
                .fold(0usize, |acc, &b| (acc << 8) | b as usize);
            (2 + octets, len)
        }
        _ => {
            warn!("Unsupported ASN.1 length encoding");
            return Err(SocketError::TlsCertificateError);
        }
    };

    if header_len + body_len != der.len() {
        warn!(
            "ASN.1 length mismatch: header says {}, have {}",
            header_len + body_len,
            der.len()
        );
        return Err(SocketError::TlsCertificateError);
    }

    Ok(())
}

/// Strip PEM armour and decode the base64 body
#[cfg(feature = "pem")]
pub fn decode_pem(pem: &[u8]) -> Result<heapless::Vec<u8, MAX_PEM_DER_LEN>, SocketError> {
    use base64::Engine;

    const BEGIN: &[u8] = b"-----BEGIN ";
    const END: &[u8] = b"-----END ";

    let start = find(pem, BEGIN).ok_or(SocketError::TlsCertificateError)?;
    // Body starts on the line after the BEGIN marker
    let body_start = pem[start..]
        .iter()
        .position(|&b| b == b'\n')
        .map(|p| start + p + 1)
        .ok_or(SocketError::TlsCertificateError)?;
    let body_end = find(&pem[body_start..], END)
        .map(|p| body_start + p)
        .ok_or(SocketError::TlsCertificateError)?;

    let mut body: heapless::Vec<u8, MAX_PEM_BODY_LEN> = heapless::Vec::new();
    for &b in pem[body_start..body_end]
        .iter()
        .filter(|b| !b.is_ascii_whitespace())
    {
        body.push(b).map_err(|_| {
            error!("PEM object larger than {} bytes", MAX_PEM_DER_LEN);
            SocketError::TlsCertificateError
        })?;
    }

    let mut der: heapless::Vec<u8, MAX_PEM_DER_LEN> = heapless::Vec::new();
    der.resize(MAX_PEM_DER_LEN, 0)
        .map_err(|_| SocketError::TlsCertificateError)?;
    let len = base64::engine::general_purpose::STANDARD
        .decode_slice(&body, &mut der)
        .map_err(|_| {
            warn!("Invalid base64 in PEM body");
            SocketError::TlsCertificateError
        })?;
    der.truncate(len);

    Ok(der)
}

#[cfg(feature = "pem")]
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TINY_DER: &[u8] = &[0x30, 0x03, 0x02, 0x01, 0x05];

    #[test]
    fn test_check_der_short_form() {
        assert!(check_der(TINY_DER).is_ok());
    }

    #[test]
    fn test_check_der_long_form() {
        let mut der = [0u8; 131];
        der[0] = 0x30;
        der[1] = 0x81;
        der[2] = 0x80;
        assert!(check_der(&der).is_ok());
        assert_eq!(
            check_der(&der[..130]),
            Err(SocketError::TlsCertificateError)
        );
    }

    #[test]
    fn test_check_der_rejects_garbage() {
        assert!(check_der(&[]).is_err());
        assert!(check_der(&[0x04, 0x01, 0x00]).is_err());
        // Indefinite length
        assert!(check_der(&[0x30, 0x80, 0x00, 0x00]).is_err());
        // Trailing bytes
        assert!(check_der(&[0x30, 0x00, 0xFF]).is_err());
    }

    #[test]
    fn test_credentials_require_key_with_cert() {
        let bundle = CertificateBundle {
            client_cert: Some(TINY_DER),
            ..CertificateBundle::default()
        };
        assert!(matches!(
            Credentials::parse(&bundle),
            Err(SocketError::TlsCertificateError)
        ));

        let bundle = CertificateBundle {
            client_key: Some(TINY_DER),
            ..bundle
        };
        let creds = Credentials::parse(&bundle).unwrap();
        assert!(creds.has_client_auth());
        assert!(creds.ca_cert.is_none());
    }

    #[test]
    fn test_credentials_from_ca_only() {
        let creds = Credentials::parse(&CertificateBundle::ca_der(TINY_DER)).unwrap();
        assert!(!creds.has_client_auth());
        assert_eq!(creds.ca_cert.as_ref().map(Certificate::as_der), Some(TINY_DER));
    }

    #[cfg(feature = "pem")]
    #[test]
    fn test_decode_pem() {
        let pem = b"-----BEGIN CERTIFICATE-----\r\nMAMC\r\nAQU=\r\n-----END CERTIFICATE-----\r\n";
        let der = decode_pem(pem).unwrap();
        assert_eq!(&der[..], TINY_DER);

        let bundle = CertificateBundle {
            format: CertificateFormat::Pem,
            ca_cert: Some(pem),
            ..CertificateBundle::default()
        };
        let creds = Credentials::parse(&bundle).unwrap();
        assert_eq!(creds.ca_cert.unwrap().as_der(), TINY_DER);
    }

    #[cfg(feature = "pem")]
    #[test]
    fn test_decode_pem_without_armour() {
        assert!(decode_pem(b"MAMCAQU=").is_err());
    }
}
