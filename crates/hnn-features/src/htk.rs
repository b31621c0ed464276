//! HTK parameter file reading.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use hnn_core::{FrameMatrix, HnnError, HnnResult, Observation, ObservationReader};
use tracing::debug;

const HEADER_LEN: usize = 12;
const BASE_MASK: u16 = 0o77;
const HAS_COMPRESSION: u16 = 0o2000;
const HAS_CRC: u16 = 0o10000;
const WAVEFORM: u16 = 0;
const DISCRETE: u16 = 10;

/// Header of an HTK parameter file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HtkHeader {
    pub n_samples: usize,
    /// Frame period in 100 ns units.
    pub sample_period: u32,
    /// Bytes per frame.
    pub sample_size: usize,
    pub parm_kind: u16,
}

impl HtkHeader {
    pub fn parse(bytes: &[u8]) -> HnnResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(HnnError::InvalidData(format!(
                "HTK header needs {HEADER_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let n_samples = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let sample_period = i32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let sample_size = i16::from_be_bytes([bytes[8], bytes[9]]);
        let parm_kind = u16::from_be_bytes([bytes[10], bytes[11]]);
        if n_samples < 0 || sample_period <= 0 || sample_size <= 0 {
            return Err(HnnError::InvalidData(format!(
                "bad HTK header: {n_samples} samples, period {sample_period}, size {sample_size}"
            )));
        }
        Ok(Self {
            n_samples: n_samples as usize,
            sample_period: sample_period as u32,
            sample_size: sample_size as usize,
            parm_kind,
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&(self.n_samples as i32).to_be_bytes());
        out[4..8].copy_from_slice(&(self.sample_period as i32).to_be_bytes());
        out[8..10].copy_from_slice(&(self.sample_size as i16).to_be_bytes());
        out[10..12].copy_from_slice(&self.parm_kind.to_be_bytes());
        out
    }

    pub fn base_kind(&self) -> u16 {
        self.parm_kind & BASE_MASK
    }

    pub fn is_compressed(&self) -> bool {
        self.parm_kind & HAS_COMPRESSION != 0
    }

    pub fn has_crc(&self) -> bool {
        self.parm_kind & HAS_CRC != 0
    }

    /// Values per frame.
    pub fn dim(&self) -> usize {
        self.sample_size / 4
    }
}

/// Read an uncompressed HTK parameter file into frames.
pub fn read_htk_params(path: impl AsRef<Path>) -> HnnResult<(HtkHeader, FrameMatrix)> {
    let path = path.as_ref();
    let bytes = fs::read(path)?;
    let header = HtkHeader::parse(&bytes)?;

    if header.is_compressed() {
        return Err(HnnError::InvalidData(format!(
            "{}: compressed parameter files are not supported",
            path.display()
        )));
    }
    if matches!(header.base_kind(), WAVEFORM | DISCRETE) || header.sample_size % 4 != 0 {
        return Err(HnnError::InvalidData(format!(
            "{}: parameter kind {:#o} with {}-byte samples is not a float vector",
            path.display(),
            header.parm_kind,
            header.sample_size
        )));
    }

    let dim = header.dim();
    let payload = header.n_samples * header.sample_size;
    let available = bytes.len() - HEADER_LEN;
    if available < payload {
        return Err(HnnError::InvalidData(format!(
            "{}: expected {payload} payload bytes, found {available}",
            path.display()
        )));
    }

    let data: Vec<f32> = bytes[HEADER_LEN..HEADER_LEN + payload]
        .chunks_exact(4)
        .map(|c| f32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    debug!(
        "read {} ({} frames x {})",
        path.display(),
        header.n_samples,
        dim
    );
    Ok((header, FrameMatrix::new(data, header.n_samples, dim)?))
}

/// Write frames as an uncompressed HTK parameter file of kind USER.
pub fn write_htk_params(
    path: impl AsRef<Path>,
    frames: &FrameMatrix,
    sample_period: u32,
) -> HnnResult<()> {
    let header = HtkHeader {
        n_samples: frames.rows(),
        sample_period,
        sample_size: frames.cols() * 4,
        parm_kind: 9,
    };
    let mut file = fs::File::create(path)?;
    file.write_all(&header.to_bytes())?;
    let mut payload = Vec::with_capacity(frames.as_slice().len() * 4);
    for v in frames.as_slice() {
        payload.extend_from_slice(&v.to_be_bytes());
    }
    file.write_all(&payload)?;
    Ok(())
}

/// Reads `<dir>/<name>.<ext>` for each input stream.
#[derive(Debug, Clone)]
pub struct HtkObservationReader {
    streams: Vec<(PathBuf, String)>,
}

impl HtkObservationReader {
    pub fn new(dir: impl Into<PathBuf>, ext: impl Into<String>) -> Self {
        Self {
            streams: vec![(dir.into(), ext.into())],
        }
    }

    /// Add another input stream; returns its index.
    pub fn add_stream(&mut self, dir: impl Into<PathBuf>, ext: impl Into<String>) -> usize {
        self.streams.push((dir.into(), ext.into()));
        self.streams.len() - 1
    }

    pub fn path_for(&self, name: &str, stream: usize) -> HnnResult<PathBuf> {
        let (dir, ext) = self.streams.get(stream).ok_or_else(|| {
            HnnError::Config(format!(
                "input stream {stream} is not configured ({} streams)",
                self.streams.len()
            ))
        })?;
        Ok(if ext.is_empty() {
            dir.join(name)
        } else {
            dir.join(format!("{name}.{ext}"))
        })
    }
}

impl ObservationReader for HtkObservationReader {
    fn read(&mut self, name: &str, stream: usize) -> HnnResult<Observation> {
        let (_, frames) = read_htk_params(self.path_for(name, stream)?)?;
        Ok(Observation::new(frames))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip_and_flags() {
        let header = HtkHeader {
            n_samples: 3,
            sample_period: 100_000,
            sample_size: 8,
            parm_kind: 6 | HAS_COMPRESSION,
        };
        let parsed = HtkHeader::parse(&header.to_bytes()).expect("parse");
        assert_eq!(parsed, header);
        assert_eq!(parsed.base_kind(), 6);
        assert!(parsed.is_compressed());
        assert!(!parsed.has_crc());
        assert_eq!(parsed.dim(), 2);
    }

    #[test]
    fn test_short_header_rejected() {
        assert!(matches!(
            HtkHeader::parse(&[0u8; 5]),
            Err(HnnError::InvalidData(_))
        ));
    }

    #[test]
    fn test_read_written_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let frames = FrameMatrix::new(vec![1.0, -2.0, 0.5, 3.25, 0.0, 7.0], 3, 2).expect("frames");
        write_htk_params(dir.path().join("a.fea"), &frames, 100_000).expect("write");

        let mut reader = HtkObservationReader::new(dir.path(), "fea");
        let obs = reader.read("a", 0).expect("read");
        assert_eq!(obs.frames, frames);
        assert!(reader.read("a", 1).is_err());
    }

    #[test]
    fn test_compressed_rejected() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("c.fea");
        let header = HtkHeader {
            n_samples: 1,
            sample_period: 100_000,
            sample_size: 4,
            parm_kind: 6 | HAS_COMPRESSION,
        };
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 16]);
        fs::write(&path, bytes).expect("write");
        assert!(matches!(
            read_htk_params(&path),
            Err(HnnError::InvalidData(_))
        ));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("t.fea");
        let header = HtkHeader {
            n_samples: 4,
            sample_period: 100_000,
            sample_size: 8,
            parm_kind: 9,
        };
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 8]);
        fs::write(&path, bytes).expect("write");
        assert!(read_htk_params(&path).is_err());
    }
}
