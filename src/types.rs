// Stream descriptors and samples
//
// A `StreamDescriptor` is the immutable contract of one stream: identity, shape and
// value encoding. Every sample pushed to or pulled from that stream carries exactly
// `channel_count` values of the descriptor's encoding. Mixed encodings on one stream
// are a configuration error, so `SampleValues` is a tagged variant that is checked
// once against the descriptor rather than coerced per value.

use crate::clock::local_clock;
use crate::error::{LslError, LslResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Upper bound on the number of channels of a single stream
pub const MAX_CHANNELS: u32 = 2000;

/// Longest name, content type or source id, in bytes
///
/// Keeps a whole descriptor inside one discovery datagram.
pub const MAX_TEXT_FIELD_LEN: usize = 4096;

/// Sampling rate value that marks a stream as irregular
pub const IRREGULAR_RATE: f64 = 0.0;

/// Value encoding shared by every channel of a stream
///
/// Wire codes follow the Lab Streaming Layer channel-format numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueEncoding {
    Float32,
    Double64,
    String,
    Int32,
    Int16,
    Int8,
    Int64,
}

impl ValueEncoding {
    pub const ALL: [ValueEncoding; 7] = [
        ValueEncoding::Float32,
        ValueEncoding::Double64,
        ValueEncoding::String,
        ValueEncoding::Int32,
        ValueEncoding::Int16,
        ValueEncoding::Int8,
        ValueEncoding::Int64,
    ];

    pub fn wire_code(self) -> u8 {
        match self {
            ValueEncoding::Float32 => 1,
            ValueEncoding::Double64 => 2,
            ValueEncoding::String => 3,
            ValueEncoding::Int32 => 4,
            ValueEncoding::Int16 => 5,
            ValueEncoding::Int8 => 6,
            ValueEncoding::Int64 => 7,
        }
    }

    pub fn from_wire_code(code: u8) -> LslResult<Self> {
        ValueEncoding::ALL
            .into_iter()
            .find(|encoding| encoding.wire_code() == code)
            .ok_or_else(|| LslError::Protocol(format!("Unknown value encoding code {}", code)))
    }

    /// Canonical name, as accepted by `FromStr` and used in predicates
    pub fn name(self) -> &'static str {
        match self {
            ValueEncoding::Float32 => "float32",
            ValueEncoding::Double64 => "double64",
            ValueEncoding::String => "string",
            ValueEncoding::Int32 => "int32",
            ValueEncoding::Int16 => "int16",
            ValueEncoding::Int8 => "int8",
            ValueEncoding::Int64 => "int64",
        }
    }

    /// Size in bytes of one value on the wire, `None` for variable-length strings
    pub fn value_size(self) -> Option<usize> {
        match self {
            ValueEncoding::String => None,
            ValueEncoding::Int8 => Some(1),
            ValueEncoding::Int16 => Some(2),
            ValueEncoding::Float32 | ValueEncoding::Int32 => Some(4),
            ValueEncoding::Double64 | ValueEncoding::Int64 => Some(8),
        }
    }
}

impl fmt::Display for ValueEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ValueEncoding {
    type Err = LslError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "string" | "string32" => Ok(ValueEncoding::String),
            "float" | "float32" => Ok(ValueEncoding::Float32),
            "double" | "double64" | "float64" => Ok(ValueEncoding::Double64),
            "int" | "int32" => Ok(ValueEncoding::Int32),
            "int16" => Ok(ValueEncoding::Int16),
            "int8" => Ok(ValueEncoding::Int8),
            "int64" => Ok(ValueEncoding::Int64),
            _ => Err(LslError::Configuration(format!(
                "Unsupported value encoding '{}'",
                s
            ))),
        }
    }
}

/// Nominal sampling rate of a stream
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "hz", rename_all = "snake_case")]
pub enum NominalRate {
    /// Samples arrive at no fixed rate (markers, events)
    Irregular,
    /// Samples arrive at a fixed rate in Hz
    Regular(f64),
}

impl NominalRate {
    /// Interpret a rate in Hz; `0.0` means irregular
    pub fn from_hz(hz: f64) -> LslResult<Self> {
        if !hz.is_finite() || hz < 0.0 {
            return Err(LslError::Configuration(format!(
                "Nominal rate must be a finite, non-negative number of Hz (got {})",
                hz
            )));
        }
        if hz == IRREGULAR_RATE {
            Ok(NominalRate::Irregular)
        } else {
            Ok(NominalRate::Regular(hz))
        }
    }

    pub fn as_hz(self) -> f64 {
        match self {
            NominalRate::Irregular => IRREGULAR_RATE,
            NominalRate::Regular(hz) => hz,
        }
    }

    pub fn is_irregular(self) -> bool {
        matches!(self, NominalRate::Irregular)
    }
}

impl fmt::Display for NominalRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NominalRate::Irregular => f.write_str("irregular"),
            NominalRate::Regular(hz) => write!(f, "{} Hz", hz),
        }
    }
}

/// Immutable metadata identifying a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    name: String,
    content_type: String,
    channel_count: u32,
    nominal_rate: NominalRate,
    encoding: ValueEncoding,
    source_id: String,
    uid: String,
    hostname: String,
    created_at: f64,
}

/// Raw descriptor fields as read off the wire
pub(crate) struct DescriptorParts {
    pub name: String,
    pub content_type: String,
    pub channel_count: u32,
    pub nominal_rate: f64,
    pub encoding: ValueEncoding,
    pub source_id: String,
    pub uid: String,
    pub hostname: String,
    pub created_at: f64,
}

impl StreamDescriptor {
    /// Describe a new stream
    ///
    /// # Arguments
    /// * `name` - Stream name used for resolution (e.g. "Markers")
    /// * `content_type` - Content type (e.g. "EEG", "Markers", "Gaze")
    /// * `channel_count` - Channels per sample, `1..=MAX_CHANNELS`
    /// * `nominal_rate` - Regular rate in Hz or irregular
    /// * `encoding` - Value encoding of every channel
    /// * `source_id` - Stable producer identity, may be empty
    pub fn new(
        name: impl Into<String>,
        content_type: impl Into<String>,
        channel_count: u32,
        nominal_rate: NominalRate,
        encoding: ValueEncoding,
        source_id: impl Into<String>,
    ) -> LslResult<Self> {
        let name = name.into();
        let content_type = content_type.into();
        let source_id = source_id.into();
        validate_name(&name)?;
        validate_text_field("content type", &content_type)?;
        validate_text_field("source id", &source_id)?;
        validate_channel_count(channel_count)?;
        if let NominalRate::Regular(hz) = nominal_rate {
            NominalRate::from_hz(hz)?;
        }

        Ok(Self {
            name,
            content_type,
            channel_count,
            nominal_rate,
            encoding,
            source_id,
            uid: Uuid::new_v4().to_string(),
            hostname: local_hostname(),
            created_at: local_clock(),
        })
    }

    pub(crate) fn from_parts(parts: DescriptorParts) -> LslResult<Self> {
        validate_name(&parts.name)?;
        validate_channel_count(parts.channel_count)?;

        Ok(Self {
            name: parts.name,
            content_type: parts.content_type,
            channel_count: parts.channel_count,
            nominal_rate: NominalRate::from_hz(parts.nominal_rate)?,
            encoding: parts.encoding,
            source_id: parts.source_id,
            uid: parts.uid,
            hostname: parts.hostname,
            created_at: parts.created_at,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn channel_count(&self) -> u32 {
        self.channel_count
    }

    pub fn nominal_rate(&self) -> NominalRate {
        self.nominal_rate
    }

    pub fn encoding(&self) -> ValueEncoding {
        self.encoding
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Unique id of this particular outlet instance
    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Producer-side `local_clock()` value at creation
    pub fn created_at(&self) -> f64 {
        self.created_at
    }

    /// Check that `values` fits this stream: same encoding, exactly `channel_count` values
    pub fn validate_values(&self, values: &SampleValues) -> LslResult<()> {
        if values.encoding() != self.encoding {
            return Err(LslError::TypeMismatch {
                expected: self.encoding,
                actual: values.encoding(),
            });
        }
        if values.len() != self.channel_count as usize {
            return Err(LslError::SampleShape {
                expected: self.channel_count as usize,
                actual: values.len(),
            });
        }
        Ok(())
    }

    /// Check that `other` carries samples of the same layout as this descriptor
    pub fn check_layout(&self, other: &StreamDescriptor) -> LslResult<()> {
        if other.encoding != self.encoding {
            return Err(LslError::TypeMismatch {
                expected: self.encoding,
                actual: other.encoding,
            });
        }
        if other.channel_count != self.channel_count {
            return Err(LslError::SampleShape {
                expected: self.channel_count as usize,
                actual: other.channel_count as usize,
            });
        }
        Ok(())
    }

    /// Whether `other` describes the same producer, possibly restarted
    pub fn same_source(&self, other: &StreamDescriptor) -> bool {
        self.uid == other.uid || (!self.source_id.is_empty() && self.source_id == other.source_id)
    }
}

fn validate_name(name: &str) -> LslResult<()> {
    if name.trim().is_empty() {
        return Err(LslError::Configuration(
            "Stream name must not be empty".to_string(),
        ));
    }
    validate_text_field("name", name)
}

fn validate_text_field(field: &str, value: &str) -> LslResult<()> {
    if value.len() > MAX_TEXT_FIELD_LEN {
        return Err(LslError::Configuration(format!(
            "Stream {} is {} bytes long; at most {} are allowed",
            field,
            value.len(),
            MAX_TEXT_FIELD_LEN
        )));
    }
    Ok(())
}

fn validate_channel_count(channel_count: u32) -> LslResult<()> {
    if channel_count == 0 || channel_count > MAX_CHANNELS {
        return Err(LslError::Configuration(format!(
            "Channel count must be between 1 and {} (got {})",
            MAX_CHANNELS, channel_count
        )));
    }
    Ok(())
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Channel values of one sample, tagged by encoding
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "encoding", content = "values", rename_all = "snake_case")]
pub enum SampleValues {
    Float32(Vec<f32>),
    Double64(Vec<f64>),
    String(Vec<String>),
    Int32(Vec<i32>),
    Int16(Vec<i16>),
    Int8(Vec<i8>),
    Int64(Vec<i64>),
}

macro_rules! each_variant {
    ($values:expr, $v:ident => $body:expr) => {
        match $values {
            SampleValues::Float32($v) => $body,
            SampleValues::Double64($v) => $body,
            SampleValues::String($v) => $body,
            SampleValues::Int32($v) => $body,
            SampleValues::Int16($v) => $body,
            SampleValues::Int8($v) => $body,
            SampleValues::Int64($v) => $body,
        }
    };
}

impl SampleValues {
    pub fn encoding(&self) -> ValueEncoding {
        match self {
            SampleValues::Float32(_) => ValueEncoding::Float32,
            SampleValues::Double64(_) => ValueEncoding::Double64,
            SampleValues::String(_) => ValueEncoding::String,
            SampleValues::Int32(_) => ValueEncoding::Int32,
            SampleValues::Int16(_) => ValueEncoding::Int16,
            SampleValues::Int8(_) => ValueEncoding::Int8,
            SampleValues::Int64(_) => ValueEncoding::Int64,
        }
    }

    pub fn len(&self) -> usize {
        each_variant!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parse textual channel values in the given encoding
    pub fn parse<S: AsRef<str>>(encoding: ValueEncoding, tokens: &[S]) -> LslResult<Self> {
        Ok(match encoding {
            ValueEncoding::String => {
                SampleValues::String(tokens.iter().map(|t| t.as_ref().to_string()).collect())
            }
            ValueEncoding::Float32 => SampleValues::Float32(parse_tokens(encoding, tokens)?),
            ValueEncoding::Double64 => SampleValues::Double64(parse_tokens(encoding, tokens)?),
            ValueEncoding::Int32 => SampleValues::Int32(parse_tokens(encoding, tokens)?),
            ValueEncoding::Int16 => SampleValues::Int16(parse_tokens(encoding, tokens)?),
            ValueEncoding::Int8 => SampleValues::Int8(parse_tokens(encoding, tokens)?),
            ValueEncoding::Int64 => SampleValues::Int64(parse_tokens(encoding, tokens)?),
        })
    }

    pub fn to_strings(&self) -> Vec<String> {
        each_variant!(self, v => v.iter().map(|x| x.to_string()).collect())
    }
}

fn parse_tokens<T: FromStr, S: AsRef<str>>(
    encoding: ValueEncoding,
    tokens: &[S],
) -> LslResult<Vec<T>> {
    tokens
        .iter()
        .map(|token| {
            token.as_ref().parse::<T>().map_err(|_| {
                LslError::Configuration(format!(
                    "Cannot parse '{}' as {}",
                    token.as_ref(),
                    encoding
                ))
            })
        })
        .collect()
}

impl fmt::Display for SampleValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_strings().join(" "))
    }
}

/// One multi-channel sample with its producer-side timestamp
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub values: SampleValues,
    /// Producer `local_clock()` time in seconds
    pub timestamp: f64,
}

impl Sample {
    pub fn new(values: SampleValues, timestamp: f64) -> Self {
        Self { values, timestamp }
    }
}

/// Rust value types that map onto one `ValueEncoding`
pub trait ChannelValue: Sized {
    const ENCODING: ValueEncoding;

    fn into_values(values: Vec<Self>) -> SampleValues;

    fn from_values(values: SampleValues) -> Option<Vec<Self>>;
}

macro_rules! channel_value {
    ($ty:ty, $variant:ident) => {
        impl ChannelValue for $ty {
            const ENCODING: ValueEncoding = ValueEncoding::$variant;

            fn into_values(values: Vec<Self>) -> SampleValues {
                SampleValues::$variant(values)
            }

            fn from_values(values: SampleValues) -> Option<Vec<Self>> {
                match values {
                    SampleValues::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

channel_value!(f32, Float32);
channel_value!(f64, Double64);
channel_value!(String, String);
channel_value!(i32, Int32);
channel_value!(i16, Int16);
channel_value!(i8, Int8);
channel_value!(i64, Int64);

#[cfg(test)]
mod tests {
    use super::*;

    fn markers() -> StreamDescriptor {
        StreamDescriptor::new(
            "Markers",
            "Markers",
            1,
            NominalRate::Irregular,
            ValueEncoding::String,
            "",
        )
        .unwrap()
    }

    #[test]
    fn test_encoding_names() {
        assert_eq!("string".parse::<ValueEncoding>().unwrap(), ValueEncoding::String);
        assert_eq!("string32".parse::<ValueEncoding>().unwrap(), ValueEncoding::String);
        assert_eq!("float".parse::<ValueEncoding>().unwrap(), ValueEncoding::Float32);
        assert_eq!("Float32".parse::<ValueEncoding>().unwrap(), ValueEncoding::Float32);
        assert_eq!("double".parse::<ValueEncoding>().unwrap(), ValueEncoding::Double64);
        assert_eq!("int16".parse::<ValueEncoding>().unwrap(), ValueEncoding::Int16);

        let err = "complex64".parse::<ValueEncoding>().unwrap_err();
        assert!(err.is_configuration_error());
        assert!(err.to_string().contains("Unsupported value encoding"));

        for encoding in ValueEncoding::ALL {
            assert_eq!(encoding.name().parse::<ValueEncoding>().unwrap(), encoding);
            assert_eq!(
                ValueEncoding::from_wire_code(encoding.wire_code()).unwrap(),
                encoding
            );
        }
        assert!(ValueEncoding::from_wire_code(0).is_err());
        assert!(ValueEncoding::from_wire_code(42).is_err());
    }

    #[test]
    fn test_channel_count_bounds() {
        let make = |n| {
            StreamDescriptor::new("eeg", "EEG", n, NominalRate::Irregular, ValueEncoding::Float32, "")
        };
        assert!(make(0).unwrap_err().is_configuration_error());
        assert!(make(MAX_CHANNELS + 1).unwrap_err().is_configuration_error());
        assert_eq!(make(MAX_CHANNELS).unwrap().channel_count(), MAX_CHANNELS);
        assert_eq!(make(1).unwrap().channel_count(), 1);
    }

    #[test]
    fn test_nominal_rate() {
        assert_eq!(NominalRate::from_hz(0.0).unwrap(), NominalRate::Irregular);
        assert_eq!(NominalRate::from_hz(250.0).unwrap(), NominalRate::Regular(250.0));
        assert!(NominalRate::from_hz(-1.0).is_err());
        assert!(NominalRate::from_hz(f64::NAN).is_err());
        assert!(NominalRate::from_hz(f64::INFINITY).is_err());

        let bad = StreamDescriptor::new(
            "eeg",
            "EEG",
            8,
            NominalRate::Regular(-5.0),
            ValueEncoding::Float32,
            "",
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_empty_name_rejected() {
        let err = StreamDescriptor::new("  ", "EEG", 1, NominalRate::Irregular, ValueEncoding::String, "")
            .unwrap_err();
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_overlong_text_fields_rejected() {
        let long = "x".repeat(70_000);
        let new = |name: &str, content_type: &str, source_id: &str| {
            StreamDescriptor::new(name, content_type, 1, NominalRate::Irregular, ValueEncoding::Int32, source_id)
        };

        assert!(new(&long, "EEG", "").unwrap_err().is_configuration_error());
        assert!(new("Stream", &long, "").unwrap_err().is_configuration_error());
        assert!(new("Stream", "EEG", &long).unwrap_err().is_configuration_error());

        let edge = "y".repeat(MAX_TEXT_FIELD_LEN);
        let descriptor = new(&edge, &edge, &edge).unwrap();
        let advertise = crate::wire::Datagram::Advertise {
            endpoint: "10.0.0.1:4000".parse().unwrap(),
            descriptor,
        };
        assert!(advertise.encode().is_ok());
    }

    #[test]
    fn test_every_descriptor_gets_a_fresh_uid() {
        let a = markers();
        let b = markers();
        assert_ne!(a.uid(), b.uid());
        assert!(!a.hostname().is_empty());
    }

    #[test]
    fn test_validate_values() {
        let descriptor = markers();

        assert!(descriptor
            .validate_values(&SampleValues::String(vec!["event_A".to_string()]))
            .is_ok());

        match descriptor.validate_values(&SampleValues::String(vec![
            "a".to_string(),
            "b".to_string(),
        ])) {
            Err(LslError::SampleShape { expected, actual }) => {
                assert_eq!(expected, 1);
                assert_eq!(actual, 2);
            }
            other => panic!("expected SampleShape, got {:?}", other),
        }

        match descriptor.validate_values(&SampleValues::Float32(vec![1.0])) {
            Err(LslError::TypeMismatch { expected, actual }) => {
                assert_eq!(expected, ValueEncoding::String);
                assert_eq!(actual, ValueEncoding::Float32);
            }
            other => panic!("expected TypeMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_same_source() {
        let a = StreamDescriptor::new("eeg", "EEG", 2, NominalRate::Regular(100.0), ValueEncoding::Float32, "amp-1")
            .unwrap();
        let restarted =
            StreamDescriptor::new("eeg", "EEG", 2, NominalRate::Regular(100.0), ValueEncoding::Float32, "amp-1")
                .unwrap();
        let anonymous = markers();

        assert!(a.same_source(&a.clone()));
        assert!(a.same_source(&restarted));
        assert!(!anonymous.same_source(&markers()));
    }

    #[test]
    fn test_parse_values() {
        let values = SampleValues::parse(ValueEncoding::Float32, &["1.5", "-2"]).unwrap();
        assert_eq!(values, SampleValues::Float32(vec![1.5, -2.0]));
        assert_eq!(values.to_string(), "1.5 -2");

        let values = SampleValues::parse(ValueEncoding::String, &["hello"]).unwrap();
        assert_eq!(values, SampleValues::String(vec!["hello".to_string()]));

        let err = SampleValues::parse(ValueEncoding::Int8, &["300"]).unwrap_err();
        assert!(err.to_string().contains("Cannot parse '300' as int8"));
    }

    #[test]
    fn test_channel_value_round_trip() {
        let values = f32::into_values(vec![1.0, 2.0]);
        assert_eq!(values.encoding(), <f32 as ChannelValue>::ENCODING);
        assert_eq!(f32::from_values(values.clone()), Some(vec![1.0, 2.0]));
        assert_eq!(String::from_values(values), None);
    }
}
