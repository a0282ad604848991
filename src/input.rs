//! Input Validator (C3): coerces and bounds-checks inbound `terminal:input`
//! payloads before they reach a session's stdin.

use crate::error::BrokerError;

/// Either shape the wire protocol allows for `terminal:input.data`.
#[derive(Debug, Clone)]
pub enum RawInput {
    Text(String),
    Bytes(Vec<u8>),
}

/// Validate and coerce a `terminal:input` payload into raw bytes.
///
/// Control bytes are passed through untouched — a terminal session needs
/// `Ctrl+C` (`0x03`), arrow-key CSI sequences, etc. Only size and shape are
/// checked here.
pub fn validate_input(input: RawInput, max_input_bytes: usize) -> Result<Vec<u8>, BrokerError> {
    let bytes = match input {
        RawInput::Text(s) => s.into_bytes(),
        RawInput::Bytes(b) => b,
    };
    if bytes.len() > max_input_bytes {
        return Err(BrokerError::InvalidInput("input exceeds maxInputBytes"));
    }
    Ok(bytes)
}

/// Validate a `terminal:resize` request's dimensions.
pub fn validate_resize(cols: i64, rows: i64) -> Result<(u16, u16), BrokerError> {
    if cols < 1 || rows < 1 || cols > 1000 || rows > 1000 {
        return Err(BrokerError::InvalidInput("resize dimensions out of range"));
    }
    Ok((cols as u16, rows as u16))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_accepted_as_noop() {
        let bytes = validate_input(RawInput::Text(String::new()), 64).unwrap();
        assert!(bytes.is_empty());
    }

    #[test]
    fn exact_boundary_accepted_oversized_rejected() {
        let at_limit = vec![0u8; 8];
        assert!(validate_input(RawInput::Bytes(at_limit), 8).is_ok());
        let over_limit = vec![0u8; 9];
        assert!(validate_input(RawInput::Bytes(over_limit), 8).is_err());
    }

    #[test]
    fn control_bytes_pass_through() {
        let bytes = validate_input(RawInput::Bytes(vec![0x03]), 64).unwrap();
        assert_eq!(bytes, vec![0x03]);
    }

    #[test]
    fn resize_rejects_zero_dimensions() {
        assert!(validate_resize(0, 24).is_err());
        assert!(validate_resize(80, 0).is_err());
        assert!(validate_resize(80, 24).is_ok());
    }
}
