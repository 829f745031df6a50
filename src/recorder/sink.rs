//! Output sinks behind a feature recorder.
//!
//! Every recorder writes through exactly one [`Sink`]; the variant is chosen
//! once, when the recorder set is built, from a [`SinkKind`].

use crate::path::ForensicPath;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Event delivered to a user callback sink.
#[derive(Debug)]
pub enum SinkEvent<'a> {
    Feature {
        recorder: &'a str,
        line: &'a str,
    },
    Carve {
        recorder: &'a str,
        path: &'a ForensicPath,
        name: &'a str,
        data: &'a [u8],
    },
    Histogram {
        name: &'a str,
        count: u64,
        value: &'a str,
    },
}

pub type FeatureCallback = Arc<dyn Fn(&SinkEvent<'_>) + Send + Sync>;

/// Which sink every recorder in a set uses.
#[derive(Clone)]
pub enum SinkKind {
    /// `<outdir>/<name>.txt`, carves under `<outdir>/<name>/`.
    File { outdir: PathBuf },
    /// Captured in memory; read back with `FeatureRecorder::memory_lines`.
    Memory,
    /// Forwarded to a host callback.
    Callback(FeatureCallback),
}

impl fmt::Debug for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkKind::File { outdir } => f.debug_struct("File").field("outdir", outdir).finish(),
            SinkKind::Memory => f.write_str("Memory"),
            SinkKind::Callback(_) => f.write_str("Callback"),
        }
    }
}

pub(crate) enum Sink {
    File(FileSink),
    Memory(MemorySink),
    Callback { name: String, cb: FeatureCallback },
}

impl Sink {
    pub(crate) fn open(kind: &SinkKind, name: &str) -> io::Result<Self> {
        Ok(match kind {
            SinkKind::File { outdir } => Sink::File(FileSink::open(outdir, name)?),
            SinkKind::Memory => Sink::Memory(MemorySink::default()),
            SinkKind::Callback(cb) => Sink::Callback {
                name: name.to_string(),
                cb: Arc::clone(cb),
            },
        })
    }

    pub(crate) fn write_line(&mut self, line: &str) -> io::Result<()> {
        match self {
            Sink::File(f) => f.write_line(line),
            Sink::Memory(m) => {
                m.lines.push(line.to_string());
                Ok(())
            }
            Sink::Callback { name, cb } => {
                cb(&SinkEvent::Feature {
                    recorder: name,
                    line,
                });
                Ok(())
            }
        }
    }

    pub(crate) fn write_carve(
        &mut self,
        path: &ForensicPath,
        file_name: &str,
        data: &[u8],
    ) -> io::Result<()> {
        match self {
            Sink::File(f) => f.write_carve(file_name, data),
            Sink::Memory(m) => {
                m.carves.push((file_name.to_string(), data.to_vec()));
                Ok(())
            }
            Sink::Callback { name, cb } => {
                cb(&SinkEvent::Carve {
                    recorder: name,
                    path,
                    name: file_name,
                    data,
                });
                Ok(())
            }
        }
    }

    pub(crate) fn write_histogram(
        &mut self,
        hist_name: &str,
        entries: &[(String, u64)],
    ) -> io::Result<()> {
        match self {
            Sink::File(f) => f.write_histogram(hist_name, entries),
            Sink::Memory(m) => {
                m.histograms.push((hist_name.to_string(), entries.to_vec()));
                Ok(())
            }
            Sink::Callback { cb, .. } => {
                for (value, count) in entries {
                    cb(&SinkEvent::Histogram {
                        name: hist_name,
                        count: *count,
                        value,
                    });
                }
                Ok(())
            }
        }
    }

    /// Highest carve sequence already on disk, so numbering resumes past it.
    pub(crate) fn first_carve_seq(&self) -> u64 {
        match self {
            Sink::File(f) => f.first_carve_seq(),
            _ => 0,
        }
    }

    pub(crate) fn spill_dir(&self) -> Option<&Path> {
        match self {
            Sink::File(f) => Some(&f.outdir),
            _ => None,
        }
    }

    pub(crate) fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::File(f) => f.flush(),
            _ => Ok(()),
        }
    }

    /// Rewrite captured features in forensic-path order.
    pub(crate) fn sort_features(&mut self) -> io::Result<()> {
        match self {
            Sink::File(f) => f.sort_features(),
            Sink::Memory(m) => {
                sort_lines(&mut m.lines);
                Ok(())
            }
            Sink::Callback { .. } => Ok(()),
        }
    }

    pub(crate) fn memory(&self) -> Option<&MemorySink> {
        match self {
            Sink::Memory(m) => Some(m),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct MemorySink {
    pub lines: Vec<String>,
    pub carves: Vec<(String, Vec<u8>)>,
    pub histograms: Vec<(String, Vec<(String, u64)>)>,
}

pub(crate) struct FileSink {
    outdir: PathBuf,
    name: String,
    feature_path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl FileSink {
    fn open(outdir: &Path, name: &str) -> io::Result<Self> {
        let feature_path = outdir.join(format!("{name}.txt"));
        let file = File::create(&feature_path)?;
        Ok(Self {
            outdir: outdir.to_path_buf(),
            name: name.to_string(),
            feature_path,
            writer: Some(BufWriter::new(file)),
        })
    }

    fn writer(&mut self) -> io::Result<&mut BufWriter<File>> {
        if self.writer.is_none() {
            let file = OpenOptions::new().append(true).open(&self.feature_path)?;
            self.writer = Some(BufWriter::new(file));
        }
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "feature stream closed"))
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let w = self.writer()?;
        w.write_all(line.as_bytes())?;
        w.write_all(b"\n")
    }

    fn carve_dir(&self) -> PathBuf {
        self.outdir.join(&self.name)
    }

    fn write_carve(&mut self, file_name: &str, data: &[u8]) -> io::Result<()> {
        let dir = self.carve_dir();
        fs::create_dir_all(&dir)?;
        let mut out = File::create(dir.join(file_name))?;
        out.write_all(data)?;
        out.sync_all()
    }

    fn first_carve_seq(&self) -> u64 {
        let Ok(entries) = fs::read_dir(self.carve_dir()) else {
            return 0;
        };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                name.split_once('-')?.0.parse::<u64>().ok()
            })
            .max()
            .map(|max| max + 1)
            .unwrap_or(0)
    }

    fn write_histogram(&mut self, hist_name: &str, entries: &[(String, u64)]) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(self.outdir.join(format!("{hist_name}.txt")))?);
        for (value, count) in entries {
            writeln!(out, "{count}\t{value}")?;
        }
        out.flush()
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }

    fn sort_features(&mut self) -> io::Result<()> {
        if let Some(mut w) = self.writer.take() {
            w.flush()?;
        }

        let mut lines = Vec::new();
        for line in BufReader::new(File::open(&self.feature_path)?).lines() {
            lines.push(line?);
        }
        sort_lines(&mut lines);

        // Write beside the original and rename so a crash never truncates it.
        let tmp_path = self.feature_path.with_extension("tmp");
        {
            let mut out = BufWriter::new(File::create(&tmp_path)?);
            for line in &lines {
                out.write_all(line.as_bytes())?;
                out.write_all(b"\n")?;
            }
            out.flush()?;
        }
        fs::rename(tmp_path, &self.feature_path)
    }
}

/// Sort feature lines by their leading forensic path, then by text.
pub(crate) fn sort_lines(lines: &mut [String]) {
    lines.sort_by_cached_key(|line| {
        let head = line.split('\t').next().unwrap_or("");
        (ForensicPath::parse(head).ok(), line.clone())
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_lines_by_path() {
        let mut lines = vec![
            "1000\tz".to_string(),
            "512-GZIP-3\ta".to_string(),
            "20\tb".to_string(),
            "512\tc".to_string(),
        ];
        sort_lines(&mut lines);
        assert_eq!(lines, ["20\tb", "512\tc", "512-GZIP-3\ta", "1000\tz"]);
    }

    #[test]
    fn test_file_sink_resumes_carve_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = Sink::open(
            &SinkKind::File {
                outdir: dir.path().to_path_buf(),
            },
            "jpeg_carved",
        )
        .unwrap();
        assert_eq!(sink.first_carve_seq(), 0);
        sink.write_carve(&ForensicPath::new(0), "000-0.jpg", b"a").unwrap();
        sink.write_carve(&ForensicPath::new(9), "007-9.jpg", b"b").unwrap();
        assert_eq!(sink.first_carve_seq(), 8);
    }

    #[test]
    fn test_callback_sink_forwards() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));
        let captured = Arc::clone(&seen);
        let cb: FeatureCallback = Arc::new(move |ev| {
            if let SinkEvent::Feature { recorder, line } = ev {
                captured.lock().push(format!("{recorder}:{line}"));
            }
        });
        let mut sink = Sink::open(&SinkKind::Callback(cb), "email").unwrap();
        sink.write_line("0\ta@b.c").unwrap();
        assert_eq!(seen.lock().as_slice(), ["email:0\ta@b.c"]);
    }
}
