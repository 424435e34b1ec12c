//! UV file reading and writing.
//!
//! File layout:
//!
//! ```text
//! +------+---------+------------+------------------+---------------------------+
//! | CTUV | ver u16 | hdrlen u32 | descriptor JSON  | records (f32 LE) ...      |
//! +------+---------+------------+------------------+---------------------------+
//! ```
//!
//! Each record is the random parameters in descriptor order followed by the
//! visibility cube in file order. Records are packed without padding, so the
//! visibility count is the data-section length over the record size and
//! appending never touches the header.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};

use super::layout::AxisPlan;
use crate::error::{ErrorContext, PipelineError, PipelineResult};
use crate::models::{RandomParameterKind, RandomParameterSet, Scan, UvDescriptor};

pub const MAGIC: &[u8; 4] = b"CTUV";
pub const FORMAT_VERSION: u16 = 1;

/// Bytes before the header JSON.
const PREAMBLE_LEN: u64 = 4 + 2 + 4;

/// Header of an existing UV file.
#[derive(Debug, Clone, PartialEq)]
pub struct UvFileInfo {
    pub descriptor: UvDescriptor,
    /// Byte offset of the first record
    pub data_offset: u64,
    pub nvis: u64,
}

impl UvFileInfo {
    pub fn data_len(&self) -> u64 {
        self.nvis * self.descriptor.record_bytes() as u64
    }
}

/// Bytes a file holding `nvis` records of `descriptor` occupies.
pub fn file_size(descriptor: &UvDescriptor, nvis: u64) -> PipelineResult<u64> {
    Ok(header_len(descriptor)? + nvis * descriptor.record_bytes() as u64)
}

fn header_len(descriptor: &UvDescriptor) -> PipelineResult<u64> {
    Ok(PREAMBLE_LEN + serde_json::to_vec(descriptor)?.len() as u64)
}

/// Read just the header and derive the visibility count from the file length.
pub fn inspect(path: &Path) -> PipelineResult<UvFileInfo> {
    let file = File::open(path).map_err(|e| io_error("inspect_uv", path, e))?;
    let file_len = file
        .metadata()
        .map_err(|e| io_error("inspect_uv", path, e))?
        .len();
    let mut reader = BufReader::new(file);
    let (descriptor, data_offset) = read_header(&mut reader, path)?;

    let data_len = file_len.saturating_sub(data_offset);
    let record_bytes = descriptor.record_bytes() as u64;
    if record_bytes == 0 || data_len % record_bytes != 0 {
        return Err(format_error(
            path,
            format!(
                "data section of {} bytes is not a whole number of {}-byte records",
                data_len, record_bytes
            ),
        ));
    }

    Ok(UvFileInfo {
        descriptor,
        data_offset,
        nvis: data_len / record_bytes,
    })
}

/// Times (days) of the first and last record, or `None` for an empty file.
///
/// Only the two `TIME1` values are read, so this is cheap on large files.
pub fn time_span(path: &Path, info: &UvFileInfo) -> PipelineResult<Option<(f32, f32)>> {
    if info.nvis == 0 {
        return Ok(None);
    }
    let index = info
        .descriptor
        .parameter_index(RandomParameterKind::Time)
        .ok_or_else(|| format_error(path, "descriptor has no TIME1 parameter".to_string()))?;
    let mut file = File::open(path).map_err(|e| io_error("read_time_span", path, e))?;
    let record_bytes = info.descriptor.record_bytes() as u64;
    let mut time_at = |record: u64| -> PipelineResult<f32> {
        file.seek(SeekFrom::Start(
            info.data_offset + record * record_bytes + index as u64 * 4,
        ))
        .map_err(|e| io_error("read_time_span", path, e))?;
        file.read_f32::<LittleEndian>()
            .map_err(|e| io_error("read_time_span", path, e))
    };
    let first = time_at(0)?;
    let last = time_at(info.nvis - 1)?;
    Ok(Some((first, last)))
}

fn read_header<R: Read>(reader: &mut R, path: &Path) -> PipelineResult<(UvDescriptor, u64)> {
    let mut magic = [0u8; 4];
    reader
        .read_exact(&mut magic)
        .map_err(|e| io_error("read_uv_header", path, e))?;
    if &magic != MAGIC {
        return Err(format_error(path, "not a UV file (bad magic)".to_string()));
    }
    let version = reader
        .read_u16::<LittleEndian>()
        .map_err(|e| io_error("read_uv_header", path, e))?;
    if version != FORMAT_VERSION {
        return Err(format_error(
            path,
            format!("unsupported format version {}", version),
        ));
    }
    let json_len = reader
        .read_u32::<LittleEndian>()
        .map_err(|e| io_error("read_uv_header", path, e))? as usize;
    let mut json = vec![0u8; json_len];
    reader
        .read_exact(&mut json)
        .map_err(|e| io_error("read_uv_header", path, e))?;
    let descriptor: UvDescriptor = serde_json::from_slice(&json)
        .map_err(|e| format_error(path, format!("bad descriptor header: {}", e)))?;

    Ok((descriptor, PREAMBLE_LEN + json_len as u64))
}

/// Streaming writer for UV records.
pub struct UvWriter<W: Write> {
    inner: W,
    descriptor: UvDescriptor,
    record: Vec<f32>,
    cube: Vec<f32>,
    bytes: Vec<u8>,
    nvis: u64,
}

impl UvWriter<BufWriter<File>> {
    /// Create (truncating) a UV file at `path` and write its header.
    pub fn create(path: &Path, descriptor: UvDescriptor) -> PipelineResult<Self> {
        let file = File::create(path).map_err(|e| io_error("create_uv", path, e))?;
        Self::new(BufWriter::new(file), descriptor)
    }
}

impl<W: Write> UvWriter<W> {
    /// Wrap `inner` and write the file header.
    pub fn new(mut inner: W, descriptor: UvDescriptor) -> PipelineResult<Self> {
        let json = serde_json::to_vec(&descriptor)?;
        inner.write_all(MAGIC)?;
        inner.write_u16::<LittleEndian>(FORMAT_VERSION)?;
        inner.write_u32::<LittleEndian>(json.len() as u32)?;
        inner.write_all(&json)?;

        let record_len = descriptor.record_len();
        Ok(Self {
            inner,
            descriptor,
            record: Vec::with_capacity(record_len),
            cube: Vec::new(),
            bytes: vec![0u8; record_len * 4],
            nvis: 0,
        })
    }

    pub fn descriptor(&self) -> &UvDescriptor {
        &self.descriptor
    }

    /// Records written so far.
    pub fn nvis(&self) -> u64 {
        self.nvis
    }

    /// Write one record whose cube is already in file order.
    pub fn write_record(
        &mut self,
        params: &RandomParameterSet,
        file_order_vis: &[f32],
    ) -> PipelineResult<()> {
        let expected = self.descriptor.visibility_len();
        if file_order_vis.len() != expected {
            return Err(PipelineError::shape_mismatch(format!(
                "cube holds {} values, axis product is {}",
                file_order_vis.len(),
                expected
            ))
            .with_context(ErrorContext::new("write_record")));
        }

        self.record.clear();
        for kind in &self.descriptor.random_parameters {
            let value = params.get(*kind).ok_or_else(|| {
                PipelineError::shape_mismatch(format!(
                    "sample has no {} parameter",
                    kind.ptype()
                ))
                .with_context(ErrorContext::new("write_record"))
            })?;
            self.record.push(value);
        }
        self.record.extend_from_slice(file_order_vis);

        LittleEndian::write_f32_into(&self.record, &mut self.bytes);
        self.inner.write_all(&self.bytes)?;
        self.nvis += 1;
        Ok(())
    }

    /// Write every sample of `scan`.
    ///
    /// All cubes are checked against the axis product before anything is
    /// written, so a mismatching scan leaves no partial records behind.
    pub fn write_scan(&mut self, scan: &Scan) -> PipelineResult<u64> {
        let context = || ErrorContext::new("serialize_scan").with_scan(scan.meta.index);
        let plan = AxisPlan::to_file_order(&scan.layout, &self.descriptor)
            .map_err(|e| e.with_context(context()))?;
        for sample in &scan.samples {
            plan.check_len(sample.vis.len())
                .map_err(|e| e.with_context(context()))?;
        }

        let mut cube = std::mem::take(&mut self.cube);
        let result = scan.samples.iter().try_for_each(|sample| {
            plan.apply(&sample.vis, &mut cube)?;
            self.write_record(&sample.params, &cube)
        });
        self.cube = cube;
        result?;
        Ok(scan.samples.len() as u64)
    }

    /// Flush and hand back the underlying writer.
    pub fn finish(mut self) -> PipelineResult<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// Streaming reader for UV records.
pub struct UvReader<R: Read> {
    inner: R,
    info: UvFileInfo,
    remaining: u64,
    bytes: Vec<u8>,
    record: Vec<f32>,
}

impl UvReader<BufReader<File>> {
    pub fn open(path: &Path) -> PipelineResult<Self> {
        let info = inspect(path)?;
        let file = File::open(path).map_err(|e| io_error("open_uv", path, e))?;
        let mut reader = BufReader::new(file);
        read_header(&mut reader, path)?;
        Ok(Self::from_parts(reader, info))
    }
}

impl<R: Read> UvReader<R> {
    fn from_parts(inner: R, info: UvFileInfo) -> Self {
        let record_len = info.descriptor.record_len();
        Self {
            inner,
            remaining: info.nvis,
            info,
            bytes: vec![0u8; record_len * 4],
            record: vec![0f32; record_len],
        }
    }

    pub fn descriptor(&self) -> &UvDescriptor {
        &self.info.descriptor
    }

    pub fn nvis(&self) -> u64 {
        self.info.nvis
    }

    /// Next record as (parameters, file-order cube), or `None` at end of file.
    pub fn read_record(&mut self) -> PipelineResult<Option<(RandomParameterSet, Vec<f32>)>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.inner.read_exact(&mut self.bytes)?;
        LittleEndian::read_f32_into(&self.bytes, &mut self.record);
        self.remaining -= 1;

        let nrparm = self.info.descriptor.nrparm();
        let params = RandomParameterSet::from_values(
            &self.info.descriptor.random_parameters,
            &self.record[..nrparm],
        );
        Ok(Some((params, self.record[nrparm..].to_vec())))
    }

    /// Read every remaining record.
    pub fn read_all(&mut self) -> PipelineResult<Vec<(RandomParameterSet, Vec<f32>)>> {
        let mut out = Vec::with_capacity(self.remaining as usize);
        while let Some(record) = self.read_record()? {
            out.push(record);
        }
        Ok(out)
    }
}

fn io_error(operation: &str, path: &Path, err: std::io::Error) -> PipelineError {
    PipelineError::io(err.to_string())
        .with_context(ErrorContext::new(operation).with_details(path.display().to_string()))
}

fn format_error(path: &Path, message: String) -> PipelineError {
    PipelineError::format(message)
        .with_context(ErrorContext::new("read_uv").with_details(path.display().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AxisKind, CubeLayout, ScanRef, VisibilitySample};

    fn scan(nsamples: usize, nchan: usize, nstokes: usize) -> Scan {
        let layout = CubeLayout::new(vec![
            (AxisKind::Frequency, nchan),
            (AxisKind::Stokes, nstokes),
            (AxisKind::Complex, 3),
        ]);
        let samples = (0..nsamples)
            .map(|i| {
                let params = RandomParameterSet {
                    u: i as f32,
                    v: -(i as f32),
                    w: 0.5,
                    baseline: 258.0,
                    time: 0.25 + i as f32 * 1e-4,
                    source: 1.0,
                    integration_time: None,
                };
                let vis = (0..layout.len()).map(|v| (i * 1000 + v) as f32).collect();
                VisibilitySample::new(params, vis)
            })
            .collect();
        Scan {
            meta: ScanRef {
                index: 1,
                target_id: 1,
                start_time: 0.0,
                end_time: 10.0,
                samples: nsamples,
            },
            layout,
            samples,
        }
    }

    #[test]
    fn test_write_then_inspect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.uv");
        let desc = UvDescriptor::continuum(2, 4, 1, 1.0e9, 1.0e6);

        let mut writer = UvWriter::create(&path, desc.clone()).unwrap();
        assert_eq!(writer.write_scan(&scan(5, 4, 2)).unwrap(), 5);
        writer.finish().unwrap();

        let info = inspect(&path).unwrap();
        assert_eq!(info.nvis, 5);
        assert_eq!(info.descriptor, desc);
        let on_disk = std::fs::metadata(&path).unwrap().len();
        assert_eq!(on_disk, file_size(&desc, 5).unwrap());
    }

    #[test]
    fn test_read_back_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.uv");
        let desc = UvDescriptor::continuum(2, 4, 1, 1.0e9, 1.0e6);
        let input = scan(3, 4, 2);

        let mut writer = UvWriter::create(&path, desc).unwrap();
        writer.write_scan(&input).unwrap();
        writer.finish().unwrap();

        let records = UvReader::open(&path).unwrap().read_all().unwrap();
        assert_eq!(records.len(), 3);
        for ((params, vis), sample) in records.iter().zip(&input.samples) {
            assert_eq!(*params, sample.params);
            assert_eq!(*vis, sample.vis);
        }
    }

    #[test]
    fn test_shape_mismatch_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.uv");
        let desc = UvDescriptor::continuum(2, 4, 1, 1.0e9, 1.0e6);
        let mut bad = scan(3, 4, 2);
        bad.samples[2].vis.pop();

        let mut writer = UvWriter::create(&path, desc).unwrap();
        let err = writer.write_scan(&bad).unwrap_err();
        assert!(matches!(err, PipelineError::ShapeMismatch { .. }));
        assert_eq!(err.context().unwrap().scan, Some(1));
        assert_eq!(writer.nvis(), 0);
    }

    #[test]
    fn test_missing_integration_time_rejected() {
        let mut desc = UvDescriptor::continuum(1, 1, 1, 1.0e9, 1.0e6);
        desc.random_parameters
            .push(crate::models::RandomParameterKind::IntegrationTime);
        let mut writer = UvWriter::new(Vec::new(), desc).unwrap();
        let err = writer
            .write_record(&RandomParameterSet::default(), &[1.0, 2.0, 3.0])
            .unwrap_err();
        assert!(matches!(err, PipelineError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_truncated_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.uv");
        let desc = UvDescriptor::continuum(1, 2, 1, 1.0e9, 1.0e6);
        let mut writer = UvWriter::create(&path, desc).unwrap();
        writer.write_scan(&scan(2, 2, 1)).unwrap();
        writer.finish().unwrap();

        let len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 2).unwrap();

        assert!(matches!(
            inspect(&path).unwrap_err(),
            PipelineError::Format { .. }
        ));
    }

    #[test]
    fn test_time_span_reads_first_and_last() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.uv");
        let desc = UvDescriptor::continuum(2, 4, 1, 1.0e9, 1.0e6);
        let mut writer = UvWriter::create(&path, desc).unwrap();
        writer.write_scan(&scan(4, 4, 2)).unwrap();
        writer.finish().unwrap();

        let info = inspect(&path).unwrap();
        let (first, last) = time_span(&path, &info).unwrap().unwrap();
        assert_eq!(first, 0.25);
        assert_eq!(last, 0.25 + 3.0 * 1e-4);
    }
}
