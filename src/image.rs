use crate::error::{Result, ScanError};
use crate::path::ForensicPath;
use crate::sbuf::ScanBuffer;
use memmap2::Mmap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

/// Outcome of reading one page.
#[derive(Debug)]
pub enum PageRead {
    Page(ScanBuffer),
    /// The block lies past the end of the image.
    EndOfInput,
}

/// Source of page buffers for the driver
pub trait ImageReader {
    fn image_size(&self) -> u64;

    fn pagesize(&self) -> usize;

    /// Number of page-sized blocks, the last one possibly short
    fn max_blocks(&self) -> u64 {
        let pagesize = self.pagesize() as u64;
        self.image_size().div_ceil(pagesize.max(1))
    }

    /// Read up to `len` bytes at `offset`; the first `pagesize` of them are
    /// page content, the rest margin.
    fn read_range(&mut self, offset: u64, len: usize, pagesize: usize) -> Result<PageRead>;

    /// Read block `block` with up to `margin` look-ahead bytes
    fn read_block(&mut self, block: u64, margin: usize) -> Result<PageRead> {
        let pagesize = self.pagesize();
        let start = block.saturating_mul(pagesize as u64);
        self.read_range(start, pagesize + margin, pagesize)
    }
}

/// Zero-copy memory-mapped disk image with shared ownership
#[derive(Clone)]
pub struct DiskImage {
    mmap: Option<Arc<Mmap>>,
    size: u64,
    pagesize: usize,
    path: String,
}

impl DiskImage {
    /// Open a disk image file with memory mapping
    pub fn open<P: AsRef<Path>>(path: P, pagesize: usize) -> Result<Self> {
        let path_ref = path.as_ref();
        let path_str = path_ref
            .to_str()
            .ok_or_else(|| ScanError::InvalidArgument("Invalid path encoding".to_string()))?
            .to_string();
        if pagesize == 0 {
            return Err(ScanError::InvalidArgument("page size must be positive".to_string()));
        }

        let file = File::open(path_ref).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ScanError::FileNotFound(path_str.clone())
            } else {
                ScanError::Io(e)
            }
        })?;

        let size = file.metadata()?.len();

        // mmap of a zero-length file fails on some platforms
        let mmap = if size == 0 {
            None
        } else {
            let map = unsafe {
                Mmap::map(&file)
                    .map_err(|e| ScanError::Mmap(format!("Failed to mmap file: {}", e)))?
            };
            Some(Arc::new(map))
        };

        Ok(Self {
            mmap,
            size,
            pagesize,
            path: path_str,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl ImageReader for DiskImage {
    fn image_size(&self) -> u64 {
        self.size
    }

    fn pagesize(&self) -> usize {
        self.pagesize
    }

    fn read_range(&mut self, offset: u64, len: usize, pagesize: usize) -> Result<PageRead> {
        let Some(map) = self.mmap.as_ref() else {
            return Ok(PageRead::EndOfInput);
        };
        if offset >= self.size {
            return Ok(PageRead::EndOfInput);
        }
        let remaining = (self.size - offset).min(usize::MAX as u64) as usize;
        let bufsize = len.min(remaining);
        let sbuf = ScanBuffer::from_mapped(
            ForensicPath::new(offset),
            Arc::clone(map),
            offset as usize,
            bufsize,
            pagesize.min(bufsize),
        )?;
        Ok(PageRead::Page(sbuf))
    }
}

/// Image read through `Read + Seek`; each page is copied to the heap.
pub struct StreamImage<R> {
    inner: R,
    size: u64,
    pagesize: usize,
}

impl<R: Read + Seek> StreamImage<R> {
    pub fn new(mut inner: R, pagesize: usize) -> Result<Self> {
        if pagesize == 0 {
            return Err(ScanError::InvalidArgument("page size must be positive".to_string()));
        }
        let size = inner.seek(SeekFrom::End(0))?;
        Ok(Self {
            inner,
            size,
            pagesize,
        })
    }
}

impl<R: Read + Seek> ImageReader for StreamImage<R> {
    fn image_size(&self) -> u64 {
        self.size
    }

    fn pagesize(&self) -> usize {
        self.pagesize
    }

    fn read_range(&mut self, offset: u64, len: usize, pagesize: usize) -> Result<PageRead> {
        if offset >= self.size {
            return Ok(PageRead::EndOfInput);
        }
        let want = (len as u64).min(self.size - offset) as usize;

        self.inner.seek(SeekFrom::Start(offset))?;
        let mut data = Vec::with_capacity(want);
        (&mut self.inner).take(want as u64).read_to_end(&mut data)?;
        if data.is_empty() {
            return Ok(PageRead::EndOfInput);
        }
        Ok(PageRead::Page(ScanBuffer::with_margin(
            ForensicPath::new(offset),
            data,
            pagesize,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    fn page(read: PageRead) -> ScanBuffer {
        match read {
            PageRead::Page(b) => b,
            PageRead::EndOfInput => panic!("unexpected end of input"),
        }
    }

    #[test]
    fn test_disk_image_pages_with_margin() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let bytes: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
        file.write_all(&bytes).unwrap();
        file.flush().unwrap();

        let mut image = DiskImage::open(file.path(), 100).unwrap();
        assert_eq!(image.max_blocks(), 3);

        let first = page(image.read_block(0, 20).unwrap());
        assert_eq!(first.pos0().to_string(), "0");
        assert_eq!((first.pagesize(), first.bufsize()), (100, 120));

        let last = page(image.read_block(2, 20).unwrap());
        assert_eq!(last.pos0().to_string(), "200");
        assert_eq!((last.pagesize(), last.bufsize()), (50, 50));
        assert_eq!(last[0], 200);

        // pages of one map share storage
        assert!(first.shares_storage_with(&last));
        assert!(matches!(image.read_block(3, 20).unwrap(), PageRead::EndOfInput));
    }

    #[test]
    fn test_empty_and_missing_images() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut image = DiskImage::open(file.path(), 4096).unwrap();
        assert_eq!(image.max_blocks(), 0);
        assert!(matches!(image.read_block(0, 0).unwrap(), PageRead::EndOfInput));
        assert!(matches!(
            DiskImage::open("/definitely/not/here.raw", 4096),
            Err(ScanError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_stream_image_matches_disk_layout() {
        let bytes: Vec<u8> = (0..250u32).map(|i| (i * 7) as u8).collect();
        let mut image = StreamImage::new(Cursor::new(bytes.clone()), 100).unwrap();
        assert_eq!(image.max_blocks(), 3);
        let mid = page(image.read_block(1, 30).unwrap());
        assert_eq!(mid.pos0().to_string(), "100");
        assert_eq!((mid.pagesize(), mid.bufsize()), (100, 130));
        assert_eq!(mid.data(), &bytes[100..230]);
        assert!(matches!(image.read_block(9, 0).unwrap(), PageRead::EndOfInput));
    }

    #[test]
    fn test_read_range_at_unaligned_offset() {
        let bytes: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
        let mut image = StreamImage::new(Cursor::new(bytes), 100).unwrap();
        let sbuf = page(image.read_range(130, 500, 10).unwrap());
        assert_eq!(sbuf.pos0().to_string(), "130");
        assert_eq!((sbuf.pagesize(), sbuf.bufsize()), (10, 120));
        assert_eq!(sbuf[0], 130);
    }
}
