//! Line-ending policy applied to outgoing commands

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::TransportError;

/// Terminator appended to every command written to the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineEnding {
    /// Carriage return only (`\r`)
    Cr,
    /// Line feed only (`\n`)
    Lf,
    /// Carriage return followed by line feed (`\r\n`)
    #[default]
    #[serde(rename = "crlf")]
    CrLf,
    /// No terminator
    #[serde(rename = "no_crlf")]
    None,
}

impl LineEnding {
    /// Terminator bytes for this policy
    pub fn terminator(self) -> &'static [u8] {
        match self {
            LineEnding::Cr => b"\r",
            LineEnding::Lf => b"\n",
            LineEnding::CrLf => b"\r\n",
            LineEnding::None => b"",
        }
    }

    /// Encode a command as wire bytes
    pub fn encode(self, command: &str) -> Vec<u8> {
        let terminator = self.terminator();
        let mut bytes = Vec::with_capacity(command.len() + terminator.len());
        bytes.extend_from_slice(command.as_bytes());
        bytes.extend_from_slice(terminator);
        bytes
    }

    /// Name as accepted on the command line
    pub fn as_str(self) -> &'static str {
        match self {
            LineEnding::Cr => "cr",
            LineEnding::Lf => "lf",
            LineEnding::CrLf => "crlf",
            LineEnding::None => "no_crlf",
        }
    }
}

impl fmt::Display for LineEnding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LineEnding {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cr" => Ok(LineEnding::Cr),
            "lf" => Ok(LineEnding::Lf),
            "crlf" => Ok(LineEnding::CrLf),
            "no_crlf" | "none" => Ok(LineEnding::None),
            other => Err(TransportError::Configuration(format!(
                "unknown line ending '{}', expected one of cr|lf|crlf|no_crlf",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_each_policy() {
        assert_eq!(LineEnding::Cr.encode("AT"), b"AT\r".to_vec());
        assert_eq!(LineEnding::Lf.encode("AT"), b"AT\n".to_vec());
        assert_eq!(LineEnding::CrLf.encode("AT"), b"AT\r\n".to_vec());
        assert_eq!(LineEnding::None.encode("AT"), b"AT".to_vec());
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!("CRLF".parse::<LineEnding>().unwrap(), LineEnding::CrLf);
        assert_eq!("No_CrLf".parse::<LineEnding>().unwrap(), LineEnding::None);
        assert_eq!(" lf ".parse::<LineEnding>().unwrap(), LineEnding::Lf);
    }

    #[test]
    fn test_parse_unknown_is_configuration_error() {
        let err = "nl".parse::<LineEnding>().unwrap_err();
        assert!(matches!(err, TransportError::Configuration(_)));
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        for ending in [LineEnding::Cr, LineEnding::Lf, LineEnding::CrLf, LineEnding::None] {
            assert_eq!(ending.to_string().parse::<LineEnding>().unwrap(), ending);
        }
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&LineEnding::None).unwrap();
        assert_eq!(json, "\"no_crlf\"");
        let parsed: LineEnding = serde_json::from_str("\"crlf\"").unwrap();
        assert_eq!(parsed, LineEnding::CrLf);
    }
}
