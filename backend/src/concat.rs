//! Scan concatenation into one UV file per target.
//!
//! Averaged scans are appended as raw record bytes, never re-encoded. The
//! merged file takes its descriptor from the first non-empty scan and every
//! later scan must match it. An `AIPS NX` row per scan records where its
//! visibilities landed.

use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorContext, PipelineError, PipelineResult};
use crate::models::UvDescriptor;
use crate::staging::{Catalog, CatalogEntry, DiskId, FileKind};
use crate::tables::{cell, EngineTable, Keyword, TableRow, INDEX_TABLE};
use crate::uv::{self, UvWriter};

/// Catalog class of merged target files.
pub const MERGE_CLASS: &str = "merge";

/// One `AIPS NX` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRow {
    pub scan: u32,
    /// Days from the reference epoch
    pub time_centroid: f64,
    /// Days
    pub time_interval: f64,
    pub source_id: u32,
    pub subarray: u32,
    pub freq_id: u32,
    /// 1-based, inclusive
    pub start_vis: u64,
    pub end_vis: u64,
}

impl IndexRow {
    pub fn nvis(&self) -> u64 {
        self.end_vis + 1 - self.start_vis
    }

    fn to_table_row(&self) -> TableRow {
        let mut row = TableRow::new();
        row.insert("TIME".to_string(), cell(self.time_centroid));
        row.insert("TIME INTERVAL".to_string(), cell(self.time_interval));
        row.insert("SOURCE ID".to_string(), cell(self.source_id));
        row.insert("SUBARRAY".to_string(), cell(self.subarray));
        row.insert("FREQ ID".to_string(), cell(self.freq_id));
        row.insert("START VIS".to_string(), cell(self.start_vis));
        row.insert("END VIS".to_string(), cell(self.end_vis));
        row
    }
}

/// A finished target file, ready for imaging.
#[derive(Debug, Clone)]
pub struct AccumulatedTarget {
    pub target: String,
    pub entry: CatalogEntry,
    pub descriptor: UvDescriptor,
    pub nvis: u64,
    pub index: Vec<IndexRow>,
}

impl AccumulatedTarget {
    pub fn path(&self) -> &Path {
        &self.entry.path
    }
}

struct MergeFile {
    entry: CatalogEntry,
    descriptor: UvDescriptor,
    writer: BufWriter<File>,
}

impl MergeFile {
    /// Copy exactly `len` record bytes from `source`.
    ///
    /// On any failure the file is cut back to its previous length, so a
    /// dropped scan leaves no partial records behind.
    fn append_records<R: Read>(&mut self, source: R, len: u64) -> PipelineResult<()> {
        self.writer.flush()?;
        let committed = self.writer.get_ref().metadata()?.len();
        let result = match std::io::copy(&mut source.take(len), &mut self.writer) {
            Ok(copied) if copied == len => self.writer.flush().map_err(PipelineError::from),
            Ok(copied) => Err(PipelineError::io(format!(
                "copied {} of {} bytes",
                copied, len
            ))),
            Err(e) => Err(e.into()),
        };
        if result.is_err() {
            self.truncate_to(committed)?;
        }
        result
    }

    fn truncate_to(&mut self, len: u64) -> PipelineResult<()> {
        // Buffered bytes must reach the file before it is cut
        self.writer.flush()?;
        let file = self.writer.get_mut();
        file.set_len(len)?;
        file.seek(SeekFrom::Start(len))?;
        warn!("Rolled back merged file {} to {} bytes", self.entry.path.display(), len);
        Ok(())
    }
}

/// Per-target merged UV file, built one scan at a time.
pub struct TargetAccumulator {
    catalog: Catalog,
    disk: DiskId,
    target: String,
    source_id: u32,
    file: Option<MergeFile>,
    nvis: u64,
    index: Vec<IndexRow>,
    last_time: Option<f32>,
    skipped: Vec<u32>,
}

impl TargetAccumulator {
    pub fn new(catalog: Catalog, disk: DiskId, target: &str, source_id: u32) -> Self {
        Self {
            catalog,
            disk,
            target: target.to_string(),
            source_id,
            file: None,
            nvis: 0,
            index: Vec::new(),
            last_time: None,
            skipped: Vec::new(),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn nvis(&self) -> u64 {
        self.nvis
    }

    pub fn index(&self) -> &[IndexRow] {
        &self.index
    }

    /// Scans that were empty after averaging.
    pub fn skipped(&self) -> &[u32] {
        &self.skipped
    }

    /// Merged file path, once the first non-empty scan has arrived.
    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(|f| f.entry.path.as_path())
    }

    /// Append the records of `path` (scan `scan`) and return how many were added.
    ///
    /// Scans must arrive in time order. An empty scan is logged and skipped.
    pub fn append(&mut self, scan: u32, path: &Path) -> PipelineResult<u64> {
        let context = || {
            ErrorContext::new("concat_scan")
                .with_target(&self.target)
                .with_scan(scan)
                .with_details(path.display().to_string())
        };
        let info = uv::inspect(path).map_err(|e| e.for_target(&self.target).for_scan(scan))?;
        let Some((first, last)) =
            uv::time_span(path, &info).map_err(|e| e.for_target(&self.target).for_scan(scan))?
        else {
            warn!("No visibilities to merge for scan {} of '{}'", scan, self.target);
            self.skipped.push(scan);
            return Ok(0);
        };

        if let Some(previous) = self.last_time {
            if first < previous {
                return Err(PipelineError::format(format!(
                    "scan starts at {} days, before the previous scan ended at {}",
                    first, previous
                ))
                .with_context(context()));
            }
        }

        if self.file.is_none() {
            let created = self.create(&info.descriptor)?;
            self.file = Some(created);
        }
        let Some(file) = self.file.as_mut() else {
            return Ok(0);
        };
        file.descriptor
            .check_compatible(&info.descriptor)
            .map_err(|msg| PipelineError::shape_mismatch(msg).with_context(context()))?;

        let mut source = File::open(path)?;
        source.seek(SeekFrom::Start(info.data_offset))?;
        file.append_records(source, info.data_len())
            .map_err(|e| e.with_context(context()))?;

        let row = IndexRow {
            scan,
            time_centroid: (first as f64 + last as f64) / 2.0,
            time_interval: (last - first) as f64,
            source_id: self.source_id,
            subarray: 1,
            freq_id: 1,
            start_vis: self.nvis + 1,
            end_vis: self.nvis + info.nvis,
        };
        debug!(
            "Merged scan {} into '{}' as visibilities {}..={}",
            scan, self.target, row.start_vis, row.end_vis
        );
        self.nvis += info.nvis;
        self.index.push(row);
        self.last_time = Some(last);
        Ok(info.nvis)
    }

    fn create(&self, descriptor: &UvDescriptor) -> PipelineResult<MergeFile> {
        let entry = self
            .catalog
            .allocate(self.disk, &self.target, MERGE_CLASS, FileKind::Uv)?;
        let mut descriptor = descriptor.clone();
        descriptor.object = self.target.clone();
        let writer = UvWriter::create(&entry.path, descriptor.clone())?.finish()?;
        info!("Creating merged file {}", entry.path.display());
        Ok(MergeFile {
            entry,
            descriptor,
            writer,
        })
    }

    /// Flush the merged file and attach its index table.
    ///
    /// Fails with `EmptyTarget` when no scan contributed any visibilities.
    pub fn finish(self) -> PipelineResult<AccumulatedTarget> {
        let Some(mut file) = self.file else {
            return Err(PipelineError::empty_target(format!(
                "no visibilities survived for '{}'",
                self.target
            ))
            .with_context(ErrorContext::new("finish_target").with_target(&self.target)));
        };
        file.writer.flush()?;

        let mut table = EngineTable::new(INDEX_TABLE, 1);
        table.set_keyword("NO_IF", Keyword::int(1));
        table.rows = self.index.iter().map(IndexRow::to_table_row).collect();
        table.write(&file.entry.path)?;

        info!(
            "Merged {} scans ({} visibilities) for '{}'",
            self.index.len(),
            self.nvis,
            self.target
        );
        Ok(AccumulatedTarget {
            target: self.target,
            entry: file.entry,
            descriptor: file.descriptor,
            nvis: self.nvis,
            index: self.index,
        })
    }
}

/// Merge `scans` (index, path) in the given order in one call.
pub fn concat_batch(
    catalog: Catalog,
    disk: DiskId,
    target: &str,
    source_id: u32,
    scans: &[(u32, PathBuf)],
) -> PipelineResult<AccumulatedTarget> {
    let mut accumulator = TargetAccumulator::new(catalog, disk, target, source_id);
    for (scan, path) in scans {
        accumulator.append(*scan, path)?;
    }
    accumulator.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RandomParameterKind, RandomParameterSet};
    use crate::tables::row_f64;

    fn write_scan(path: &Path, desc: &UvDescriptor, times: &[f32]) {
        let mut writer = UvWriter::create(path, desc.clone()).unwrap();
        let cube = vec![1.0; desc.visibility_len()];
        for t in times {
            let params = RandomParameterSet {
                time: *t,
                baseline: 258.0,
                ..Default::default()
            };
            writer.write_record(&params, &cube).unwrap();
        }
        writer.finish().unwrap();
    }

    fn setup() -> (tempfile::TempDir, Catalog, UvDescriptor) {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(vec![dir.path().to_path_buf()]);
        (dir, catalog, UvDescriptor::continuum(1, 2, 1, 1.0e9, 1.0e6))
    }

    #[test]
    fn test_append_builds_index() {
        let (dir, catalog, desc) = setup();
        let a = dir.path().join("a.uv");
        let b = dir.path().join("b.uv");
        let empty = dir.path().join("empty.uv");
        write_scan(&a, &desc, &[0.1, 0.2]);
        write_scan(&empty, &desc, &[]);
        write_scan(&b, &desc, &[0.3, 0.4, 0.5]);

        let mut acc = TargetAccumulator::new(catalog, DiskId(1), "PKS 1934", 2);
        assert_eq!(acc.append(1, &a).unwrap(), 2);
        assert_eq!(acc.append(2, &empty).unwrap(), 0);
        assert_eq!(acc.append(3, &b).unwrap(), 3);
        assert_eq!(acc.skipped(), &[2]);

        let merged = acc.finish().unwrap();
        assert_eq!(merged.nvis, 5);
        assert_eq!(merged.descriptor.object, "PKS 1934");
        assert_eq!(uv::inspect(merged.path()).unwrap().nvis, 5);
        assert_eq!((merged.index[1].start_vis, merged.index[1].end_vis), (3, 5));

        let nx = EngineTable::read_latest(merged.path(), INDEX_TABLE).unwrap();
        assert_eq!(nx.rows.len(), 2);
        assert_eq!(row_f64(&nx.rows[0], "SOURCE ID"), Some(2.0));
        assert_eq!(row_f64(&nx.rows[1], "START VIS"), Some(3.0));
    }

    #[test]
    fn test_out_of_order_scan_rejected() {
        let (dir, catalog, desc) = setup();
        let late = dir.path().join("late.uv");
        let early = dir.path().join("early.uv");
        write_scan(&late, &desc, &[0.5]);
        write_scan(&early, &desc, &[0.1]);

        let mut acc = TargetAccumulator::new(catalog, DiskId(1), "t", 1);
        acc.append(2, &late).unwrap();
        let err = acc.append(1, &early).unwrap_err();
        assert!(matches!(err, PipelineError::Format { .. }));
        assert_eq!(acc.nvis(), 1);
    }

    #[test]
    fn test_incompatible_descriptor_rejected() {
        let (dir, catalog, desc) = setup();
        let a = dir.path().join("a.uv");
        let b = dir.path().join("b.uv");
        write_scan(&a, &desc, &[0.1]);
        let mut averaged = desc.clone();
        averaged
            .random_parameters
            .push(RandomParameterKind::IntegrationTime);
        let mut writer = UvWriter::create(&b, averaged.clone()).unwrap();
        let params = RandomParameterSet {
            time: 0.2,
            integration_time: Some(8.0),
            ..Default::default()
        };
        writer
            .write_record(&params, &vec![0.0; averaged.visibility_len()])
            .unwrap();
        writer.finish().unwrap();

        let mut acc = TargetAccumulator::new(catalog, DiskId(1), "t", 1);
        acc.append(1, &a).unwrap();
        let err = acc.append(2, &b).unwrap_err();
        assert!(matches!(err, PipelineError::ShapeMismatch { .. }));
        assert_eq!(err.context().unwrap().scan, Some(2));
    }

    #[test]
    fn test_no_surviving_scans_is_empty_target() {
        let (dir, catalog, desc) = setup();
        let empty = dir.path().join("empty.uv");
        write_scan(&empty, &desc, &[]);

        let err = concat_batch(catalog.clone(), DiskId(1), "t", 1, &[(1, empty)]).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyTarget { .. }));
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_batch_matches_incremental() {
        let (dir, catalog, desc) = setup();
        let scans: Vec<(u32, PathBuf)> = (0..3)
            .map(|i| {
                let path = dir.path().join(format!("s{}.uv", i));
                write_scan(&path, &desc, &[i as f32, i as f32 + 0.5]);
                (i, path)
            })
            .collect();

        let batch = concat_batch(catalog.clone(), DiskId(1), "t", 1, &scans).unwrap();
        let mut acc = TargetAccumulator::new(catalog, DiskId(1), "t", 1);
        for (i, path) in &scans {
            acc.append(*i, path).unwrap();
        }
        let incremental = acc.finish().unwrap();

        assert_ne!(batch.path(), incremental.path());
        assert_eq!(
            std::fs::read(batch.path()).unwrap(),
            std::fs::read(incremental.path()).unwrap()
        );
        assert_eq!(batch.index, incremental.index);
    }

    /// Yields `ok` bytes, then fails.
    struct FailingReader {
        ok: usize,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.ok == 0 {
                return Err(std::io::Error::other("device gone"));
            }
            let n = self.ok.min(buf.len());
            buf[..n].fill(0);
            self.ok -= n;
            Ok(n)
        }
    }

    #[test]
    fn test_failed_copy_leaves_no_partial_records() {
        let (dir, catalog, desc) = setup();
        let a = dir.path().join("a.uv");
        let b = dir.path().join("b.uv");
        write_scan(&a, &desc, &[0.1, 0.2]);
        write_scan(&b, &desc, &[0.3, 0.4, 0.5]);
        let record = desc.record_bytes() as u64;

        let mut acc = TargetAccumulator::new(catalog, DiskId(1), "t", 1);
        acc.append(1, &a).unwrap();
        let path = acc.file.as_ref().unwrap().entry.path.clone();
        let committed = std::fs::metadata(&path).unwrap().len();

        let file = acc.file.as_mut().unwrap();
        let err = file
            .append_records(FailingReader { ok: 5 }, 2 * record)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Io { .. }));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), committed);

        // Source ends early
        let short = vec![0u8; record as usize + 3];
        let err = file.append_records(&short[..], 2 * record).unwrap_err();
        assert!(err.to_string().contains("copied"));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), committed);

        assert_eq!(acc.append(2, &b).unwrap(), 3);
        let merged = acc.finish().unwrap();
        assert_eq!(uv::inspect(merged.path()).unwrap().nvis, 5);
        let times: Vec<f32> = uv::UvReader::open(merged.path())
            .unwrap()
            .read_all()
            .unwrap()
            .iter()
            .map(|(p, _)| p.time)
            .collect();
        assert_eq!(times, vec![0.1, 0.2, 0.3, 0.4, 0.5]);
    }
}
