//! Point cloud frame recording.
//!
//! Frames are appended to `recording_<device>_<date>.bin` as an ASCII
//! header (`n_points= <n>` and `frame_timestamp= <ts>` lines) followed by
//! the packed little-endian millimeter points, the colors in B,G,R byte
//! order and a trailing newline. Empty frames are valid.

use chrono::Local;
use rigscan_core::{Point3s, Rgb};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecordingError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed frame header")]
    MalformedHeader,
}

/// Writes and reads back the recording file of one client.
///
/// The file is created lazily on the first written frame; reading switches
/// the handle over to the same file from the start.
pub struct FrameRecorder {
    dir: PathBuf,
    path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
    reader: Option<BufReader<File>>,
    recording_started: Instant,
}

impl FrameRecorder {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            path: None,
            writer: None,
            reader: None,
            recording_started: Instant::now(),
        }
    }

    /// Close any open file handle. The next written frame starts a new
    /// recording file.
    pub fn close(&mut self) {
        self.writer = None;
        self.reader = None;
        self.path = None;
    }

    pub fn reset_timer(&mut self) {
        self.recording_started = Instant::now();
    }

    pub fn elapsed_recording_ms(&self) -> u128 {
        self.recording_started.elapsed().as_millis()
    }

    /// Append one frame.
    pub fn write_frame(
        &mut self,
        points: &[Point3s],
        colors: &[Rgb],
        timestamp_us: u64,
        device_id: usize,
    ) -> Result<(), RecordingError> {
        if self.writer.is_none() {
            self.open_new_for_writing(device_id)?;
        }
        let writer = self.writer.as_mut().ok_or(RecordingError::MalformedHeader)?;

        write!(writer, "n_points= {}\nframe_timestamp= {}\n", points.len(), timestamp_us)?;

        if !points.is_empty() {
            for p in points {
                writer.write_all(&p.x.to_le_bytes())?;
                writer.write_all(&p.y.to_le_bytes())?;
                writer.write_all(&p.z.to_le_bytes())?;
            }
            for c in colors {
                writer.write_all(&[c.b, c.g, c.r])?;
            }
        }

        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    /// Read the next recorded frame; `Ok(None)` once the file is
    /// exhausted (or nothing was ever recorded).
    pub fn read_frame(&mut self) -> Result<Option<(Vec<Point3s>, Vec<Rgb>)>, RecordingError> {
        if self.reader.is_none() && !self.open_for_reading()? {
            return Ok(None);
        }
        let reader = self.reader.as_mut().ok_or(RecordingError::MalformedHeader)?;

        let Some(n_points) = read_header_value(reader, "n_points=")? else {
            return Ok(None);
        };
        let Some(_timestamp) = read_header_value(reader, "frame_timestamp=")? else {
            return Err(RecordingError::MalformedHeader);
        };

        let n = n_points as usize;
        let mut points = Vec::with_capacity(n);
        let mut colors = Vec::with_capacity(n);

        if n > 0 {
            let mut point_bytes = vec![0u8; n * 6];
            reader.read_exact(&mut point_bytes)?;
            for chunk in point_bytes.chunks_exact(6) {
                points.push(Point3s::new(
                    i16::from_le_bytes([chunk[0], chunk[1]]),
                    i16::from_le_bytes([chunk[2], chunk[3]]),
                    i16::from_le_bytes([chunk[4], chunk[5]]),
                ));
            }

            let mut color_bytes = vec![0u8; n * 3];
            reader.read_exact(&mut color_bytes)?;
            for chunk in color_bytes.chunks_exact(3) {
                colors.push(Rgb::new(chunk[2], chunk[1], chunk[0]));
            }
        }

        // Trailing frame delimiter; tolerate truncation here.
        let mut newline = [0u8; 1];
        let _ = reader.read_exact(&mut newline);

        Ok(Some((points, colors)))
    }

    fn open_new_for_writing(&mut self, device_id: usize) -> Result<(), RecordingError> {
        self.close();

        let stamp = Local::now().format("%Y_%m_%d_%H_%M_%S");
        let path = self.dir.join(format!("recording_{device_id}_{stamp}.bin"));
        self.writer = Some(BufWriter::new(File::create(&path)?));
        self.path = Some(path);
        self.reset_timer();
        Ok(())
    }

    /// Switch the handle over to reading the current recording file.
    fn open_for_reading(&mut self) -> Result<bool, RecordingError> {
        if let Some(writer) = self.writer.take() {
            writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        }

        let Some(path) = self.path.as_ref() else {
            return Ok(false);
        };
        self.reader = Some(BufReader::new(File::open(path)?));
        Ok(true)
    }
}

/// Read a `label value` header line. `Ok(None)` means clean end of file
/// before the line started.
fn read_header_value(
    reader: &mut BufReader<File>,
    label: &str,
) -> Result<Option<u64>, RecordingError> {
    let mut line: Vec<u8> = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte)? {
            0 => {
                if line.iter().all(|b| b.is_ascii_whitespace()) {
                    return Ok(None);
                }
                return Err(RecordingError::MalformedHeader);
            }
            _ => {
                if byte[0] == b'\n' {
                    break;
                }
                line.push(byte[0]);
            }
        }
    }

    let text = String::from_utf8_lossy(&line);
    let mut parts = text.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(l), Some(v)) if l == label => {
            v.parse::<u64>().map(Some).map_err(|_| RecordingError::MalformedHeader)
        }
        (None, _) => Ok(None), // blank line between frames
        _ => Err(RecordingError::MalformedHeader),
    }
}
