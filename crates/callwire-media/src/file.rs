//! File-backed sources: IVF (VP8/VP9) and raw H.264 Annex-B.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use callwire_common::{Error, Result};
use webrtc::media::io::h264_reader::H264Reader;
use webrtc::media::io::ivf_reader::IVFReader;

use crate::{VideoCodec, DEFAULT_FRAME_DURATION};

const IVF_SIGNATURE: &[u8; 4] = b"DKIF";
const H264_READ_BUFFER: usize = 1024 * 1024;

/// Container detected from the first bytes of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Ivf(VideoCodec),
    AnnexB,
}

impl Container {
    pub fn codec(self) -> VideoCodec {
        match self {
            Container::Ivf(codec) => codec,
            Container::AnnexB => VideoCodec::H264,
        }
    }
}

/// Identify and validate the container of `path`.
pub fn probe(path: &Path) -> Result<Container> {
    let mut file = File::open(path)
        .map_err(|e| Error::media_unavailable(format!("{}: {e}", path.display())))?;
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic).map_err(|_| {
        Error::media_unavailable(format!("{}: file too short", path.display()))
    })?;

    if &magic == IVF_SIGNATURE {
        let file = File::open(path)?;
        let (_, header) = IVFReader::new(BufReader::new(file)).map_err(|e| {
            Error::media_unavailable(format!("{}: corrupt IVF header: {e}", path.display()))
        })?;
        let codec = match &header.four_cc {
            b"VP80" => VideoCodec::Vp8,
            b"VP90" => VideoCodec::Vp9,
            other => {
                return Err(Error::media_unavailable(format!(
                    "{}: unsupported IVF codec {}",
                    path.display(),
                    String::from_utf8_lossy(other)
                )))
            }
        };
        return Ok(Container::Ivf(codec));
    }

    if magic[..3] == [0, 0, 1] || magic == [0, 0, 0, 1] {
        return Ok(Container::AnnexB);
    }

    Err(Error::media_unavailable(format!(
        "{}: not an IVF or H.264 Annex-B file",
        path.display()
    )))
}

/// Sequential reader yielding `(payload, duration)` samples.
pub enum FrameReader {
    Ivf {
        reader: IVFReader<BufReader<File>>,
        frame_duration: Duration,
    },
    AnnexB(H264Reader<Box<dyn Read + Send>>),
}

impl FrameReader {
    pub fn open(path: &Path, container: Container) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| Error::media_unavailable(format!("{}: {e}", path.display())))?;
        match container {
            Container::Ivf(_) => {
                let (reader, header) = IVFReader::new(BufReader::new(file)).map_err(|e| {
                    Error::media_unavailable(format!("{}: {e}", path.display()))
                })?;
                let frame_duration = if header.timebase_denominator > 0 {
                    Duration::from_secs_f64(
                        header.timebase_numerator as f64 / header.timebase_denominator as f64,
                    )
                } else {
                    DEFAULT_FRAME_DURATION
                };
                Ok(FrameReader::Ivf {
                    reader,
                    frame_duration,
                })
            }
            Container::AnnexB => Ok(Self::annex_b(Box::new(BufReader::new(file)))),
        }
    }

    pub fn annex_b(stream: Box<dyn Read + Send>) -> Self {
        FrameReader::AnnexB(H264Reader::new(stream, H264_READ_BUFFER))
    }

    /// Next sample, or `None` at end of stream.
    pub fn next_sample(&mut self) -> Option<(Bytes, Duration)> {
        match self {
            FrameReader::Ivf {
                reader,
                frame_duration,
            } => reader
                .parse_next_frame()
                .ok()
                .map(|(frame, _)| (frame.freeze(), *frame_duration)),
            FrameReader::AnnexB(reader) => {
                let nal = reader.next_nal().ok()?;
                let data = nal.data.freeze();
                // Parameter sets and SEI share the timestamp of the next slice.
                let duration = match data.first().map(|b| b & 0x1f) {
                    Some(1) | Some(5) => DEFAULT_FRAME_DURATION,
                    _ => Duration::ZERO,
                };
                Some((data, duration))
            }
        }
    }
}
