use crate::append_log::Entry;
use crate::keys::{DiscoveryHandle, ReadKey};
use crate::replication::proto::{
    proto_frame, ProtoEntries, ProtoExtension, ProtoFrame, ProtoHandshake, ProtoHave, ProtoLogHead, ProtoSyncComplete,
};
use bytes::{Bytes, BytesMut};
use prost::Message;
use std::convert::{TryFrom, TryInto};
use std::io;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// One message on a replication stream.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Frame {
    Handshake(Handshake),
    Have(Vec<LogHead>),
    Entries { read_key: ReadKey, entries: Vec<Entry> },
    SyncComplete,
    Extension { id: u32, payload: Bytes },
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Handshake {
    pub(crate) protocol_version: u32,
    pub(crate) discovery_handle: DiscoveryHandle,
    pub(crate) extensions: Vec<String>,
    pub(crate) live: bool,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) struct LogHead {
    pub(crate) read_key: ReadKey,
    pub(crate) length: u64,
}

/// FrameCodec turns a byte stream into `Frame`s: a 4 byte big-endian length, then a protobuf
/// `ProtoFrame`.
#[derive(Clone)]
pub(crate) struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub(crate) fn new(max_frame_length: usize) -> Self {
        FrameCodec {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(max_frame_length)
                .new_codec(),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        let bytes = match self.inner.decode(src)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };

        let proto = ProtoFrame::decode(bytes.freeze())?;
        convert_frame(proto).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let proto = convert_proto_frame(frame);
        self.inner.encode(Bytes::from(proto.encode_to_vec()), dst)?;
        Ok(())
    }
}

fn convert_proto_frame(frame: Frame) -> ProtoFrame {
    let body = match frame {
        Frame::Handshake(handshake) => proto_frame::Body::Handshake(ProtoHandshake {
            protocol_version: handshake.protocol_version,
            discovery_handle: handshake.discovery_handle.as_bytes().to_vec(),
            extensions: handshake.extensions,
            live: handshake.live,
        }),
        Frame::Have(heads) => proto_frame::Body::Have(ProtoHave {
            logs: heads
                .into_iter()
                .map(|head| ProtoLogHead {
                    read_key: head.read_key.as_bytes().to_vec(),
                    length: head.length,
                })
                .collect(),
        }),
        Frame::Entries { read_key, entries } => proto_frame::Body::Entries(ProtoEntries {
            read_key: read_key.as_bytes().to_vec(),
            entries: entries.into_iter().map(Vec::<u8>::from).collect(),
        }),
        Frame::SyncComplete => proto_frame::Body::SyncComplete(ProtoSyncComplete {}),
        Frame::Extension { id, payload } => proto_frame::Body::Extension(ProtoExtension {
            id,
            payload: payload.to_vec(),
        }),
    };

    ProtoFrame { body: Some(body) }
}

fn convert_frame(proto: ProtoFrame) -> Result<Frame, FrameError> {
    let body = proto.body.ok_or(FrameError::Invalid("frame has no body"))?;

    let frame = match body {
        proto_frame::Body::Handshake(handshake) => {
            let discovery_handle: [u8; 32] = handshake
                .discovery_handle
                .as_slice()
                .try_into()
                .map_err(|_| FrameError::Invalid("discovery handle must be 32 bytes"))?;
            Frame::Handshake(Handshake {
                protocol_version: handshake.protocol_version,
                discovery_handle: DiscoveryHandle::from_bytes(discovery_handle),
                extensions: handshake.extensions,
                live: handshake.live,
            })
        }
        proto_frame::Body::Have(have) => {
            let mut heads = Vec::with_capacity(have.logs.len());
            for head in have.logs {
                heads.push(LogHead {
                    read_key: convert_read_key(&head.read_key)?,
                    length: head.length,
                });
            }
            Frame::Have(heads)
        }
        proto_frame::Body::Entries(proto_entries) => {
            let mut entries = Vec::with_capacity(proto_entries.entries.len());
            for bytes in proto_entries.entries {
                entries.push(Entry::try_from(bytes).map_err(|_| FrameError::Invalid("malformed entry"))?);
            }
            Frame::Entries {
                read_key: convert_read_key(&proto_entries.read_key)?,
                entries,
            }
        }
        proto_frame::Body::SyncComplete(_) => Frame::SyncComplete,
        proto_frame::Body::Extension(extension) => Frame::Extension {
            id: extension.id,
            payload: Bytes::from(extension.payload),
        },
    };

    Ok(frame)
}

fn convert_read_key(bytes: &[u8]) -> Result<ReadKey, FrameError> {
    ReadKey::try_from_slice(bytes).map_err(|_| FrameError::Invalid("malformed read key"))
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum FrameError {
    #[error("Stream error")]
    Io(#[from] io::Error),
    #[error("Frame is not a valid protobuf message")]
    Decode(#[from] prost::DecodeError),
    #[error("Invalid frame: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::Sequence;
    use crate::keys::KeyPair;

    fn encode(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::new(1024).encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn decodes_frames_split_across_reads() {
        let writer = KeyPair::generate();
        let entry = Entry::sign(writer.write_key(), Sequence::start(), None, Bytes::from_static(b"{}"));
        let frames = vec![
            Frame::Have(vec![LogHead {
                read_key: writer.read_key(),
                length: 1,
            }]),
            Frame::Entries {
                read_key: writer.read_key(),
                entries: vec![entry],
            },
            Frame::SyncComplete,
        ];

        let mut stream = BytesMut::new();
        for frame in frames.iter().cloned() {
            stream.extend_from_slice(&encode(frame));
        }

        let mut codec = FrameCodec::new(1024);
        let mut decoded = vec![];
        let mut buf = BytesMut::new();
        // Feed a few bytes at a time, as a socket would.
        for chunk in stream.chunks(7) {
            buf.extend_from_slice(chunk);
            while let Some(frame) = codec.decode(&mut buf).unwrap() {
                decoded.push(frame);
            }
        }

        assert_eq!(frames, decoded);
    }

    #[test]
    fn rejects_oversized_and_malformed_frames() {
        let big = Frame::Extension {
            id: 0,
            payload: Bytes::from(vec![0u8; 2048]),
        };
        let mut buf = encode_unbounded(big);
        assert!(matches!(FrameCodec::new(1024).decode(&mut buf), Err(FrameError::Io(_))));

        let mut buf = BytesMut::new();
        LengthDelimitedCodec::new()
            .encode(Bytes::from(ProtoFrame { body: None }.encode_to_vec()), &mut buf)
            .unwrap();
        assert!(matches!(
            FrameCodec::new(1024).decode(&mut buf),
            Err(FrameError::Invalid(_))
        ));
    }

    fn encode_unbounded(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::new(usize::MAX).encode(frame, &mut buf).unwrap();
        buf
    }
}
