//! ECDSA P-256 signature normalization.
//!
//! JWS `ES256` wants the signature as a fixed 64-byte `r || s`. Signing
//! backends hand back either that form or an ASN.1 DER `SEQUENCE { INTEGER r,
//! INTEGER s }` whose integers carry a sign-forcing `0x00` or are shorter
//! than 32 bytes. [`normalize_signature`] maps both onto the raw form.
//!
//! Detection rule: input that starts with the `SEQUENCE` tag and parses as a
//! complete DER structure is DER. Any other 64-byte input is already raw.
//! Everything else is [`CryptoError::MalformedSignature`].

use super::error::CryptoError;

/// Length of a raw P-256 `r || s` signature.
pub const RAW_SIGNATURE_LEN: usize = 64;

/// Length of a single scalar component.
const COMPONENT_LEN: usize = 32;

const SEQUENCE_TAG: u8 = 0x30;
const INTEGER_TAG: u8 = 0x02;

/// Normalize a P-256 signature to raw 64-byte `r || s`.
pub fn normalize_signature(signature: &[u8]) -> Result<[u8; RAW_SIGNATURE_LEN], CryptoError> {
    if signature.first() == Some(&SEQUENCE_TAG) {
        match parse_der(signature) {
            Ok(raw) => return Ok(raw),
            // A raw r whose first byte happens to be 0x30
            Err(_) if signature.len() == RAW_SIGNATURE_LEN => {}
            Err(err) => return Err(err),
        }
    }

    if signature.len() != RAW_SIGNATURE_LEN {
        return Err(CryptoError::MalformedSignature(format!(
            "expected {RAW_SIGNATURE_LEN} raw bytes or a DER sequence, got {} bytes",
            signature.len()
        )));
    }
    let mut raw = [0u8; RAW_SIGNATURE_LEN];
    raw.copy_from_slice(signature);
    Ok(raw)
}

fn malformed(reason: &str) -> CryptoError {
    CryptoError::MalformedSignature(reason.to_string())
}

fn parse_der(der: &[u8]) -> Result<[u8; RAW_SIGNATURE_LEN], CryptoError> {
    let mut reader = DerReader::new(der);
    reader.expect_tag(SEQUENCE_TAG)?;
    let body_len = reader.read_length()?;
    if reader.remaining() != body_len {
        return Err(malformed("sequence length does not match input"));
    }

    let r = reader.read_integer()?;
    let s = reader.read_integer()?;
    if reader.remaining() != 0 {
        return Err(malformed("trailing bytes after signature"));
    }

    let mut raw = [0u8; RAW_SIGNATURE_LEN];
    write_component(&mut raw[..COMPONENT_LEN], r)?;
    write_component(&mut raw[COMPONENT_LEN..], s)?;
    Ok(raw)
}

/// Left-pad `value` (leading zeros stripped) into a 32-byte slot.
fn write_component(slot: &mut [u8], value: &[u8]) -> Result<(), CryptoError> {
    let first_nonzero = value.iter().position(|&b| b != 0).unwrap_or(value.len());
    let magnitude = &value[first_nonzero..];
    if magnitude.len() > COMPONENT_LEN {
        return Err(malformed("integer component wider than 32 bytes"));
    }
    slot[COMPONENT_LEN - magnitude.len()..].copy_from_slice(magnitude);
    Ok(())
}

/// Minimal cursor over the handful of DER constructs an ECDSA signature uses.
struct DerReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> DerReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn read_byte(&mut self) -> Result<u8, CryptoError> {
        let byte = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| malformed("unexpected end of DER input"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn expect_tag(&mut self, tag: u8) -> Result<(), CryptoError> {
        let found = self.read_byte()?;
        if found == tag {
            Ok(())
        } else {
            Err(CryptoError::MalformedSignature(format!(
                "expected DER tag {tag:#04x}, found {found:#04x}"
            )))
        }
    }

    /// Short form, or the single-byte long form (`0x81 nn`). A P-256
    /// signature never needs more.
    fn read_length(&mut self) -> Result<usize, CryptoError> {
        match self.read_byte()? {
            len @ 0x00..=0x7f => Ok(usize::from(len)),
            0x81 => Ok(usize::from(self.read_byte()?)),
            _ => Err(malformed("unsupported DER length encoding")),
        }
    }

    fn read_integer(&mut self) -> Result<&'a [u8], CryptoError> {
        self.expect_tag(INTEGER_TAG)?;
        let len = self.read_length()?;
        if len == 0 {
            return Err(malformed("empty DER integer"));
        }
        if len > self.remaining() {
            return Err(malformed("DER integer runs past end of input"));
        }
        let value = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::{signature::Signer, Signature, SigningKey};
    use p256::elliptic_curve::rand_core::OsRng;

    /// Build `SEQUENCE { INTEGER r, INTEGER s }` from already-encoded integer bodies.
    fn der(r: &[u8], s: &[u8]) -> Vec<u8> {
        let mut body = vec![INTEGER_TAG, r.len() as u8];
        body.extend_from_slice(r);
        body.push(INTEGER_TAG);
        body.push(s.len() as u8);
        body.extend_from_slice(s);

        let mut out = vec![SEQUENCE_TAG, body.len() as u8];
        out.extend_from_slice(&body);
        out
    }

    fn raw(r: &[u8; 32], s: &[u8; 32]) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(r);
        out[32..].copy_from_slice(s);
        out
    }

    #[test]
    fn test_raw_signature_passes_through() {
        let sig = raw(&[0x11; 32], &[0x22; 32]);
        assert_eq!(normalize_signature(&sig).unwrap(), sig);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let sig = raw(&[0x9a; 32], &[0x05; 32]);
        let once = normalize_signature(&sig).unwrap();
        let twice = normalize_signature(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_der_with_sign_padding_is_stripped() {
        // High bit set on both: DER prepends 0x00 to each, making 33-byte integers
        let r = [0x80; 32];
        let s = [0xff; 32];
        let mut r_der = vec![0x00];
        r_der.extend_from_slice(&r);
        let mut s_der = vec![0x00];
        s_der.extend_from_slice(&s);

        let encoded = der(&r_der, &s_der);
        assert_eq!(encoded.len(), 72);
        assert_eq!(normalize_signature(&encoded).unwrap(), raw(&r, &s));
    }

    #[test]
    fn test_der_short_integers_are_left_padded() {
        // r = 0x00 0x00 0x7f ..., minimal DER drops the two leading zero bytes
        let mut r = [0x7f; 32];
        r[0] = 0;
        r[1] = 0;
        let s = [0x01; 32];

        let encoded = der(&r[2..], &s);
        assert_eq!(normalize_signature(&encoded).unwrap(), raw(&r, &s));
    }

    #[test]
    fn test_der_padding_variants_agree() {
        let mut r = [0x42; 32];
        r[0] = 0;
        let s = [0x24; 32];

        let minimal = der(&r[1..], &s);
        let full_width = der(&r, &s);
        let mut over_padded_r = vec![0x00, 0x00];
        over_padded_r.extend_from_slice(&r);
        let over_padded = der(&over_padded_r, &s);

        let expected = raw(&r, &s);
        assert_eq!(normalize_signature(&minimal).unwrap(), expected);
        assert_eq!(normalize_signature(&full_width).unwrap(), expected);
        assert_eq!(normalize_signature(&over_padded).unwrap(), expected);
    }

    #[test]
    fn test_real_p256_der_matches_raw() {
        let key = SigningKey::random(&mut OsRng);
        for msg in [b"a".as_slice(), b"header.claims".as_slice(), b"another".as_slice()] {
            let sig: Signature = key.sign(msg);
            let from_der = normalize_signature(sig.to_der().as_bytes()).unwrap();
            assert_eq!(from_der.as_slice(), sig.to_bytes().as_slice());
        }
    }

    #[test]
    fn test_raw_signature_starting_with_sequence_tag() {
        let mut r = [0x55; 32];
        r[0] = SEQUENCE_TAG;
        let sig = raw(&r, &[0x66; 32]);
        assert_eq!(normalize_signature(&sig).unwrap(), sig);
    }

    #[test]
    fn test_long_form_length_is_accepted() {
        let r = [0x80; 32];
        let s = [0x90; 32];
        let mut short = der(&r, &s);
        // Rewrite the sequence length as 0x81 nn
        let body_len = short[1];
        short.splice(1..2, [0x81, body_len]);
        assert_eq!(normalize_signature(&short).unwrap(), raw(&r, &s));
    }

    #[test]
    fn test_rejects_wrong_length_raw() {
        let err = normalize_signature(&[0x01; 63]).unwrap_err();
        assert!(matches!(err, CryptoError::MalformedSignature(_)));
        assert!(normalize_signature(&[]).is_err());
    }

    #[test]
    fn test_rejects_truncated_der() {
        let encoded = der(&[0x01; 32], &[0x02; 32]);
        let truncated = &encoded[..encoded.len() - 3];
        assert!(matches!(
            normalize_signature(truncated),
            Err(CryptoError::MalformedSignature(_))
        ));
    }

    #[test]
    fn test_rejects_oversized_integer() {
        let encoded = der(&[0x01; 33], &[0x02; 32]);
        assert!(normalize_signature(&encoded).is_err());
    }

    #[test]
    fn test_rejects_trailing_bytes() {
        let mut encoded = der(&[0x01; 20], &[0x02; 20]);
        encoded[1] += 1;
        encoded.push(0x00);
        assert!(normalize_signature(&encoded).is_err());
    }

    #[test]
    fn test_rejects_wrong_inner_tag() {
        let mut encoded = der(&[0x01; 20], &[0x02; 20]);
        encoded[2] = 0x04;
        assert!(normalize_signature(&encoded).is_err());
    }
}
