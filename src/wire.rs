//! On-wire formats
//!
//! # TCP stream protocol
//!
//! Every frame on an outlet connection is length-prefixed:
//!
//! ```text
//! ┌──────────────────┬──────────┬─────────────────────┐
//! │ Length (4 bytes) │ Tag (1)  │ Body (Length - 1)   │
//! │ Little-endian u32│          │                     │
//! └──────────────────┴──────────┴─────────────────────┘
//! ```
//!
//! | Tag    | Frame       | Direction         | Body                                        |
//! |--------|-------------|-------------------|---------------------------------------------|
//! | `0x01` | `Hello`     | inlet → outlet    | version u16, expected uid, resume flag + u64 |
//! | `0x02` | `Handshake` | outlet → inlet    | descriptor                                  |
//! | `0x03` | `Sample`    | outlet → inlet    | seq u64, timestamp f64, values              |
//! | `0x04` | `Ping`      | inlet → outlet    | t0 f64                                      |
//! | `0x05` | `Pong`      | outlet → inlet    | t0, t1, t2 f64                              |
//!
//! Sample values carry no encoding tag: the layout (encoding and channel count) is fixed
//! by the handshake. Numbers are packed little-endian, strings as u32 length + UTF-8.
//!
//! # Descriptor schema
//!
//! Magic `LSD1`, then `name`, `content_type`, `source_id`, `uid`, `hostname` (each u16
//! length + UTF-8), `channel_count` u32, `nominal_rate` f64 (0 = irregular), encoding
//! code u8, `created_at` f64. All integers little-endian.
//!
//! # Discovery datagrams
//!
//! Magic `LSLD`, version u8, kind u8, then either an advertisement (endpoint + descriptor)
//! or a query (predicate text). Endpoints are a family byte (4), four address bytes and
//! a u16 port.
//!
//! Malformed or oversized frames are protocol errors and close the connection;
//! malformed datagrams are dropped by the listener.

use crate::error::{LslError, LslResult};
use crate::predicate::MAX_PREDICATE_LEN;
use crate::types::{DescriptorParts, Sample, SampleValues, StreamDescriptor, ValueEncoding};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};

/// Version sent in `Hello`; outlets refuse other versions
pub const PROTOCOL_VERSION: u16 = 1;

const DESCRIPTOR_MAGIC: &[u8; 4] = b"LSD1";
const DATAGRAM_MAGIC: &[u8; 4] = b"LSLD";
const DATAGRAM_VERSION: u8 = 1;

/// Largest UDP payload that fits an IPv4 datagram
pub const MAX_DATAGRAM_LEN: usize = 65_507;

const TAG_HELLO: u8 = 0x01;
const TAG_HANDSHAKE: u8 = 0x02;
const TAG_SAMPLE: u8 = 0x03;
const TAG_PING: u8 = 0x04;
const TAG_PONG: u8 = 0x05;

const KIND_ADVERTISE: u8 = 1;
const KIND_QUERY: u8 = 2;

const FAMILY_IPV4: u8 = 4;

/// Frames exchanged on an outlet connection
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Hello {
        protocol_version: u16,
        /// Uid the inlet expects to reach, empty if any
        expected_uid: String,
        /// Last sequence number received from this outlet before a reconnect
        resume_after: Option<u64>,
    },
    Handshake(StreamDescriptor),
    Sample {
        seq: u64,
        sample: Arc<Sample>,
    },
    Ping {
        t0: f64,
    },
    Pong {
        t0: f64,
        t1: f64,
        t2: f64,
    },
}

/// Encoding and channel count fixed by a handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleLayout {
    pub encoding: ValueEncoding,
    pub channel_count: usize,
}

impl SampleLayout {
    pub fn of(descriptor: &StreamDescriptor) -> Self {
        Self {
            encoding: descriptor.encoding(),
            channel_count: descriptor.channel_count() as usize,
        }
    }
}

/// Length-prefixed frame codec for outlet connections
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_len: usize,
    layout: Option<SampleLayout>,
}

impl FrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            layout: None,
        }
    }

    /// Fix the layout used to decode `Sample` frames
    pub fn set_layout(&mut self, layout: SampleLayout) {
        self.layout = Some(layout);
    }

    fn decode_payload(&self, payload: &[u8]) -> LslResult<Frame> {
        let mut r = Reader::new(payload);
        let frame = match r.u8()? {
            TAG_HELLO => {
                let protocol_version = r.u16()?;
                let expected_uid = r.str16()?;
                let has_resume = r.u8()? != 0;
                let resume_seq = r.u64()?;
                Frame::Hello {
                    protocol_version,
                    expected_uid,
                    resume_after: has_resume.then_some(resume_seq),
                }
            }
            TAG_HANDSHAKE => Frame::Handshake(read_descriptor(&mut r)?),
            TAG_SAMPLE => {
                let layout = self.layout.ok_or_else(|| {
                    LslError::Protocol("Sample frame before handshake".to_string())
                })?;
                let seq = r.u64()?;
                let timestamp = r.f64()?;
                let values = read_values(&mut r, layout)?;
                Frame::Sample {
                    seq,
                    sample: Arc::new(Sample::new(values, timestamp)),
                }
            }
            TAG_PING => Frame::Ping { t0: r.f64()? },
            TAG_PONG => Frame::Pong {
                t0: r.f64()?,
                t1: r.f64()?,
                t2: r.f64()?,
            },
            tag => return Err(LslError::Protocol(format!("Unknown frame tag 0x{:02x}", tag))),
        };

        r.finish()?;
        Ok(frame)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = LslError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, LslError> {
        if src.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len == 0 || len > self.max_frame_len {
            return Err(LslError::Protocol(format!(
                "Frame length {} outside 1..={}",
                len, self.max_frame_len
            )));
        }

        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let payload = src.split_to(len);
        self.decode_payload(&payload).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = LslError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), LslError> {
        let start = dst.len();
        dst.put_u32_le(0);

        match &frame {
            Frame::Hello {
                protocol_version,
                expected_uid,
                resume_after,
            } => {
                dst.put_u8(TAG_HELLO);
                dst.put_u16_le(*protocol_version);
                put_str16(dst, expected_uid)?;
                dst.put_u8(resume_after.is_some() as u8);
                dst.put_u64_le(resume_after.unwrap_or(0));
            }
            Frame::Handshake(descriptor) => {
                dst.put_u8(TAG_HANDSHAKE);
                write_descriptor(descriptor, dst)?;
            }
            Frame::Sample { seq, sample } => {
                dst.put_u8(TAG_SAMPLE);
                dst.put_u64_le(*seq);
                dst.put_f64_le(sample.timestamp);
                write_values(&sample.values, dst)?;
            }
            Frame::Ping { t0 } => {
                dst.put_u8(TAG_PING);
                dst.put_f64_le(*t0);
            }
            Frame::Pong { t0, t1, t2 } => {
                dst.put_u8(TAG_PONG);
                dst.put_f64_le(*t0);
                dst.put_f64_le(*t1);
                dst.put_f64_le(*t2);
            }
        }

        let len = dst.len() - start - 4;
        if len > self.max_frame_len {
            dst.truncate(start);
            return Err(LslError::Protocol(format!(
                "Frame of {} bytes exceeds the {} byte limit",
                len, self.max_frame_len
            )));
        }
        dst[start..start + 4].copy_from_slice(&(len as u32).to_le_bytes());
        Ok(())
    }
}

/// Discovery datagrams
#[derive(Debug, Clone, PartialEq)]
pub enum Datagram {
    /// An outlet and the endpoint it accepts connections on
    Advertise {
        endpoint: SocketAddr,
        descriptor: StreamDescriptor,
    },
    /// Request for advertisements of outlets matching the predicate
    Query { predicate: String },
}

impl Datagram {
    pub fn encode(&self) -> LslResult<Bytes> {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_slice(DATAGRAM_MAGIC);
        buf.put_u8(DATAGRAM_VERSION);

        match self {
            Datagram::Advertise {
                endpoint,
                descriptor,
            } => {
                buf.put_u8(KIND_ADVERTISE);
                let ip = match endpoint.ip() {
                    IpAddr::V4(ip) => ip,
                    IpAddr::V6(_) => {
                        return Err(LslError::Protocol(format!(
                            "Cannot advertise IPv6 endpoint {}",
                            endpoint
                        )))
                    }
                };
                buf.put_u8(FAMILY_IPV4);
                buf.put_slice(&ip.octets());
                buf.put_u16_le(endpoint.port());
                write_descriptor(descriptor, &mut buf)?;
            }
            Datagram::Query { predicate } => {
                buf.put_u8(KIND_QUERY);
                put_str16(&mut buf, predicate)?;
            }
        }

        if buf.len() > MAX_DATAGRAM_LEN {
            return Err(LslError::Protocol(format!(
                "Datagram of {} bytes does not fit in UDP",
                buf.len()
            )));
        }
        Ok(buf.freeze())
    }

    pub fn decode(datagram: &[u8]) -> LslResult<Self> {
        let mut r = Reader::new(datagram);
        if r.take(4)? != DATAGRAM_MAGIC {
            return Err(LslError::Protocol("Not a discovery datagram".to_string()));
        }
        let version = r.u8()?;
        if version != DATAGRAM_VERSION {
            return Err(LslError::Protocol(format!(
                "Unsupported discovery version {}",
                version
            )));
        }

        let decoded = match r.u8()? {
            KIND_ADVERTISE => {
                let family = r.u8()?;
                if family != FAMILY_IPV4 {
                    return Err(LslError::Protocol(format!(
                        "Unsupported address family {}",
                        family
                    )));
                }
                let octets = r.take(4)?;
                let ip = Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]);
                let port = r.u16()?;
                Datagram::Advertise {
                    endpoint: SocketAddr::from((ip, port)),
                    descriptor: read_descriptor(&mut r)?,
                }
            }
            KIND_QUERY => {
                let predicate = r.str16()?;
                if predicate.len() > MAX_PREDICATE_LEN {
                    return Err(LslError::Protocol(format!(
                        "Query predicate of {} bytes exceeds {}",
                        predicate.len(),
                        MAX_PREDICATE_LEN
                    )));
                }
                Datagram::Query { predicate }
            }
            kind => {
                return Err(LslError::Protocol(format!(
                    "Unknown datagram kind {}",
                    kind
                )))
            }
        };

        r.finish()?;
        Ok(decoded)
    }
}

/// Serialize a descriptor in its self-describing form
pub fn encode_descriptor(descriptor: &StreamDescriptor) -> LslResult<Bytes> {
    let mut buf = BytesMut::with_capacity(128);
    write_descriptor(descriptor, &mut buf)?;
    Ok(buf.freeze())
}

/// Parse a descriptor written by `encode_descriptor`
pub fn decode_descriptor(bytes: &[u8]) -> LslResult<StreamDescriptor> {
    let mut r = Reader::new(bytes);
    let descriptor = read_descriptor(&mut r)?;
    r.finish()?;
    Ok(descriptor)
}

fn write_descriptor(descriptor: &StreamDescriptor, buf: &mut BytesMut) -> LslResult<()> {
    buf.put_slice(DESCRIPTOR_MAGIC);
    put_str16(buf, descriptor.name())?;
    put_str16(buf, descriptor.content_type())?;
    put_str16(buf, descriptor.source_id())?;
    put_str16(buf, descriptor.uid())?;
    put_str16(buf, descriptor.hostname())?;
    buf.put_u32_le(descriptor.channel_count());
    buf.put_f64_le(descriptor.nominal_rate().as_hz());
    buf.put_u8(descriptor.encoding().wire_code());
    buf.put_f64_le(descriptor.created_at());
    Ok(())
}

fn read_descriptor(r: &mut Reader<'_>) -> LslResult<StreamDescriptor> {
    if r.take(4)? != DESCRIPTOR_MAGIC {
        return Err(LslError::Protocol("Bad descriptor magic".to_string()));
    }

    let parts = DescriptorParts {
        name: r.str16()?,
        content_type: r.str16()?,
        source_id: r.str16()?,
        uid: r.str16()?,
        hostname: r.str16()?,
        channel_count: r.u32()?,
        nominal_rate: r.f64()?,
        encoding: ValueEncoding::from_wire_code(r.u8()?)?,
        created_at: r.f64()?,
    };

    // A descriptor that fails validation came from a broken or foreign peer
    StreamDescriptor::from_parts(parts)
        .map_err(|e| LslError::Protocol(format!("Invalid descriptor: {}", e)))
}

/// Payload length of the `Sample` frame that carries `values`
pub fn sample_frame_len(values: &SampleValues) -> usize {
    // tag + seq + timestamp
    let header = 1 + 8 + 8;
    let body = match values {
        SampleValues::String(v) => v.iter().map(|s| 4 + s.len()).sum(),
        _ => values.encoding().value_size().unwrap_or(0) * values.len(),
    };
    header + body
}

fn write_values(values: &SampleValues, buf: &mut BytesMut) -> LslResult<()> {
    match values {
        SampleValues::Float32(v) => v.iter().for_each(|x| buf.put_f32_le(*x)),
        SampleValues::Double64(v) => v.iter().for_each(|x| buf.put_f64_le(*x)),
        SampleValues::Int32(v) => v.iter().for_each(|x| buf.put_i32_le(*x)),
        SampleValues::Int16(v) => v.iter().for_each(|x| buf.put_i16_le(*x)),
        SampleValues::Int8(v) => v.iter().for_each(|x| buf.put_i8(*x)),
        SampleValues::Int64(v) => v.iter().for_each(|x| buf.put_i64_le(*x)),
        SampleValues::String(v) => {
            for s in v {
                let len = u32::try_from(s.len()).map_err(|_| {
                    LslError::Protocol("String value longer than 4 GiB".to_string())
                })?;
                buf.put_u32_le(len);
                buf.put_slice(s.as_bytes());
            }
        }
    }
    Ok(())
}

fn read_values(r: &mut Reader<'_>, layout: SampleLayout) -> LslResult<SampleValues> {
    let n = layout.channel_count;
    if let Some(size) = layout.encoding.value_size() {
        if r.remaining() != n * size {
            return Err(LslError::Protocol(format!(
                "Sample body of {} bytes does not hold {} {} values",
                r.remaining(),
                n,
                layout.encoding
            )));
        }
    }

    Ok(match layout.encoding {
        ValueEncoding::Float32 => SampleValues::Float32((0..n).map(|_| r.f32()).collect::<LslResult<_>>()?),
        ValueEncoding::Double64 => SampleValues::Double64((0..n).map(|_| r.f64()).collect::<LslResult<_>>()?),
        ValueEncoding::Int32 => SampleValues::Int32((0..n).map(|_| r.i32()).collect::<LslResult<_>>()?),
        ValueEncoding::Int16 => SampleValues::Int16((0..n).map(|_| r.i16()).collect::<LslResult<_>>()?),
        ValueEncoding::Int8 => SampleValues::Int8((0..n).map(|_| r.i8()).collect::<LslResult<_>>()?),
        ValueEncoding::Int64 => SampleValues::Int64((0..n).map(|_| r.i64()).collect::<LslResult<_>>()?),
        ValueEncoding::String => SampleValues::String((0..n).map(|_| r.str32()).collect::<LslResult<_>>()?),
    })
}

fn put_str16(buf: &mut BytesMut, s: &str) -> LslResult<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| LslError::Protocol(format!("String of {} bytes is too long", s.len())))?;
    buf.put_u16_le(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

/// Bounds-checked little-endian reader
struct Reader<'a> {
    buf: &'a [u8],
}

macro_rules! read_le {
    ($name:ident, $ty:ty, $get:ident) => {
        fn $name(&mut self) -> LslResult<$ty> {
            self.need(std::mem::size_of::<$ty>())?;
            Ok(self.buf.$get())
        }
    };
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn need(&self, n: usize) -> LslResult<()> {
        if self.buf.len() < n {
            return Err(LslError::Protocol(format!(
                "Truncated message: needed {} more bytes, {} left",
                n,
                self.buf.len()
            )));
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> LslResult<&'a [u8]> {
        self.need(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    read_le!(u8, u8, get_u8);
    read_le!(i8, i8, get_i8);
    read_le!(u16, u16, get_u16_le);
    read_le!(i16, i16, get_i16_le);
    read_le!(u32, u32, get_u32_le);
    read_le!(i32, i32, get_i32_le);
    read_le!(u64, u64, get_u64_le);
    read_le!(i64, i64, get_i64_le);
    read_le!(f32, f32, get_f32_le);
    read_le!(f64, f64, get_f64_le);

    fn string(&mut self, len: usize) -> LslResult<String> {
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| LslError::Protocol("String is not valid UTF-8".to_string()))
    }

    fn str16(&mut self) -> LslResult<String> {
        let len = self.u16()? as usize;
        self.string(len)
    }

    fn str32(&mut self) -> LslResult<String> {
        let len = self.u32()? as usize;
        self.string(len)
    }

    fn finish(&self) -> LslResult<()> {
        if !self.buf.is_empty() {
            return Err(LslError::Protocol(format!(
                "{} trailing bytes after message",
                self.buf.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NominalRate;
    use futures_util::StreamExt;
    use tokio_util::codec::FramedRead;

    fn descriptor(encoding: ValueEncoding, channels: u32) -> StreamDescriptor {
        StreamDescriptor::new(
            "BioSemi",
            "EEG",
            channels,
            NominalRate::Regular(512.0),
            encoding,
            "amp-42",
        )
        .unwrap()
    }

    fn encode(codec: &mut FrameCodec, frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_descriptor_schema() {
        let d = descriptor(ValueEncoding::Int16, 8);
        let bytes = encode_descriptor(&d).unwrap();

        assert_eq!(&bytes[..4], b"LSD1");
        // name is the first string: u16 length then UTF-8
        assert_eq!(&bytes[4..6], &7u16.to_le_bytes());
        assert_eq!(&bytes[6..13], b"BioSemi");

        assert_eq!(decode_descriptor(&bytes).unwrap(), d);

        let mut trailing = BytesMut::from(&bytes[..]);
        trailing.put_u8(0);
        assert!(decode_descriptor(&trailing).is_err());
        assert!(decode_descriptor(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_descriptor_rejects_bad_fields() {
        let d = descriptor(ValueEncoding::Float32, 4);
        let mut bytes = BytesMut::from(&encode_descriptor(&d).unwrap()[..]);

        // encoding code is the byte before the trailing created_at f64
        let code_at = bytes.len() - 9;
        bytes[code_at] = 99;
        assert!(matches!(decode_descriptor(&bytes), Err(LslError::Protocol(_))));
    }

    #[test]
    fn test_sample_frame_len_matches_encoder() {
        let mut codec = FrameCodec::new(1 << 20);
        for values in [
            SampleValues::String(vec!["event".to_string(), String::new()]),
            SampleValues::Float32(vec![1.0, 2.0, 3.0]),
            SampleValues::Int64(vec![7]),
            SampleValues::Int8(vec![1, 2]),
        ] {
            let expected = sample_frame_len(&values);
            let mut buf = BytesMut::new();
            codec
                .encode(
                    Frame::Sample {
                        seq: 1,
                        sample: Arc::new(Sample::new(values, 0.5)),
                    },
                    &mut buf,
                )
                .unwrap();
            assert_eq!(buf.len(), 4 + expected);
        }
    }

    #[test]
    fn test_sample_frame_layout() {
        let d = descriptor(ValueEncoding::Float32, 2);
        let mut codec = FrameCodec::new(1024);
        codec.set_layout(SampleLayout::of(&d));

        let sample = Arc::new(Sample::new(SampleValues::Float32(vec![1.5, -2.0]), 12.25));
        let mut buf = encode(
            &mut codec,
            Frame::Sample {
                seq: 7,
                sample: sample.clone(),
            },
        );
        // length + tag + seq + timestamp + 2 * f32
        assert_eq!(buf.len(), 4 + 1 + 8 + 8 + 8);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, Frame::Sample { seq: 7, sample });
        assert!(buf.is_empty());
    }

    #[test]
    fn test_sample_needs_handshake_and_matching_arity() {
        let sample = Arc::new(Sample::new(SampleValues::Float32(vec![1.0, 2.0, 3.0]), 0.0));
        let mut buf = encode(&mut FrameCodec::new(1024), Frame::Sample { seq: 0, sample });

        let mut no_layout = FrameCodec::new(1024);
        assert!(no_layout.decode(&mut buf.clone()).is_err());

        let mut codec = FrameCodec::new(1024);
        codec.set_layout(SampleLayout {
            encoding: ValueEncoding::Float32,
            channel_count: 2,
        });
        assert!(matches!(codec.decode(&mut buf), Err(LslError::Protocol(_))));
    }

    #[test]
    fn test_string_values() {
        let mut codec = FrameCodec::new(1024);
        codec.set_layout(SampleLayout {
            encoding: ValueEncoding::String,
            channel_count: 2,
        });
        let sample = Arc::new(Sample::new(
            SampleValues::String(vec!["event_A".to_string(), "ünïcode".to_string()]),
            3.5,
        ));

        let mut buf = encode(
            &mut codec,
            Frame::Sample {
                seq: 1,
                sample: sample.clone(),
            },
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Sample { seq: 1, sample })
        );
    }

    #[test]
    fn test_partial_and_oversized_frames() {
        let mut codec = FrameCodec::new(64);
        let full = encode(
            &mut codec,
            Frame::Hello {
                protocol_version: PROTOCOL_VERSION,
                expected_uid: "abc".to_string(),
                resume_after: Some(41),
            },
        );

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);
        partial.put_u8(full[full.len() - 1]);
        assert_eq!(
            codec.decode(&mut partial).unwrap(),
            Some(Frame::Hello {
                protocol_version: PROTOCOL_VERSION,
                expected_uid: "abc".to_string(),
                resume_after: Some(41),
            })
        );

        let mut oversized = BytesMut::new();
        oversized.put_u32_le(65);
        assert!(codec.decode(&mut oversized).is_err());

        let mut unknown = BytesMut::new();
        unknown.put_u32_le(1);
        unknown.put_u8(0x7f);
        assert!(codec.decode(&mut unknown).is_err());

        let big = Frame::Handshake(descriptor(ValueEncoding::Float32, 1));
        let mut tiny = FrameCodec::new(8);
        let mut buf = BytesMut::new();
        assert!(tiny.encode(big, &mut buf).is_err());
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_framed_read_over_split_io() {
        let mut codec = FrameCodec::new(1024);
        let mut wire = encode(&mut codec, Frame::Ping { t0: 1.5 });
        wire.extend_from_slice(&encode(
            &mut codec,
            Frame::Pong {
                t0: 1.5,
                t1: 2.0,
                t2: 2.25,
            },
        ));

        let io = tokio_test::io::Builder::new()
            .read(&wire[..7])
            .read(&wire[7..20])
            .read(&wire[20..])
            .build();
        let mut framed = FramedRead::new(io, FrameCodec::new(1024));

        assert_eq!(framed.next().await.unwrap().unwrap(), Frame::Ping { t0: 1.5 });
        assert_eq!(
            framed.next().await.unwrap().unwrap(),
            Frame::Pong {
                t0: 1.5,
                t1: 2.0,
                t2: 2.25
            }
        );
        assert!(framed.next().await.is_none());
    }

    #[test]
    fn test_datagrams() {
        let d = descriptor(ValueEncoding::Double64, 3);
        let advertise = Datagram::Advertise {
            endpoint: "192.168.1.20:40123".parse().unwrap(),
            descriptor: d,
        };
        let bytes = advertise.encode().unwrap();
        assert_eq!(&bytes[..4], b"LSLD");
        assert_eq!(Datagram::decode(&bytes).unwrap(), advertise);

        let query = Datagram::Query {
            predicate: "name='Markers'".to_string(),
        };
        assert_eq!(Datagram::decode(&query.encode().unwrap()).unwrap(), query);

        let oversized = Datagram::Query {
            predicate: "(".repeat(MAX_PREDICATE_LEN + 1),
        };
        assert!(Datagram::decode(&oversized.encode().unwrap()).is_err());

        assert!(Datagram::decode(b"LSLD").is_err());
        assert!(Datagram::decode(b"HTTP/1.1 200 OK").is_err());

        let v6 = Datagram::Advertise {
            endpoint: "[::1]:4000".parse().unwrap(),
            descriptor: descriptor(ValueEncoding::Int8, 1),
        };
        assert!(v6.encode().is_err());
    }
}
