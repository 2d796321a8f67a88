//! Decoding AIS points from delimited text files.
//!
//! Accepts `.csv`, `.dat`, `.csv.zst` and `.dat.zst` inputs. The outermost
//! `.zst` suffix selects transparent zstd decompression; the inner extension
//! selects the delimiter (comma for csv, tab or whitespace runs for dat,
//! sniffed from the header line). Column names are matched case-insensitively
//! against a set of aliases. Rows whose required fields fail to parse are
//! skipped and counted; the whole input is never buffered in streaming mode.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Lines, Read};
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use csv::{ReaderBuilder, StringRecord, Trim};
use tracing::{debug, info};

use crate::errors::SentinelError;
use crate::models::{AisPoint, Mmsi, HEADING_UNAVAILABLE};

/// Default number of rows decoded per streaming chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 10_000;

type RawStream = BufReader<Box<dyn Read + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delimiter {
    Comma,
    Tab,
    Whitespace,
}

/// Indices of the recognized columns within a row.
#[derive(Debug, Clone)]
struct ColumnMap {
    mmsi: usize,
    timestamp: usize,
    lat: usize,
    lon: usize,
    sog: Option<usize>,
    cog: Option<usize>,
    heading: Option<usize>,
}

impl ColumnMap {
    /// Match normalized header names against the alias sets. Missing
    /// required columns are fatal before any point is yielded.
    fn from_header(header: &[String]) -> Result<Self, SentinelError> {
        let find = |aliases: &[&str]| {
            header
                .iter()
                .position(|name| aliases.contains(&name.as_str()))
        };

        let mmsi = find(&["mmsi"]);
        let timestamp = find(&["timestamp", "base_date_time", "basedatetime", "time"]);
        let lat = find(&["lat", "latitude"]);
        let lon = find(&["lon", "longitude"]);

        let mut missing = Vec::new();
        if mmsi.is_none() {
            missing.push("mmsi".to_string());
        }
        if timestamp.is_none() {
            missing.push("timestamp".to_string());
        }
        if lat.is_none() {
            missing.push("lat".to_string());
        }
        if lon.is_none() {
            missing.push("lon".to_string());
        }
        if !missing.is_empty() {
            return Err(SentinelError::MissingColumns { columns: missing });
        }

        Ok(Self {
            mmsi: mmsi.unwrap(),
            timestamp: timestamp.unwrap(),
            lat: lat.unwrap(),
            lon: lon.unwrap(),
            sog: find(&["sog"]),
            cog: find(&["cog"]),
            heading: find(&["heading"]),
        })
    }
}

enum RowReader {
    /// Comma- or tab-delimited, decoded with the csv crate.
    Delimited {
        reader: csv::Reader<RawStream>,
        record: StringRecord,
    },
    /// Whitespace-run delimited `.dat`; the csv crate only supports
    /// single-byte delimiters, so rows are split by hand.
    Whitespace { lines: Lines<RawStream> },
}

impl std::fmt::Debug for RowReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RowReader::Delimited { .. } => f.write_str("RowReader::Delimited"),
            RowReader::Whitespace { .. } => f.write_str("RowReader::Whitespace"),
        }
    }
}

/// Counters accumulated while reading a source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoaderStats {
    /// Rows decoded into points
    pub parsed: u64,
    /// Rows discarded because a required field failed to parse
    pub skipped: u64,
}

/// A lazy, finite sequence of [`AisPoint`]s decoded from one file.
#[derive(Debug)]
pub struct PointSource {
    rows: RowReader,
    columns: ColumnMap,
    stats: LoaderStats,
    file_size: u64,
    row_fields: Vec<String>,
}

impl PointSource {
    /// Open a source file, set up decompression and delimiter handling,
    /// and validate the header. Fails without side effects when the path
    /// is missing, the stream cannot be decoded, or a required column has
    /// no recognized alias.
    pub fn open(path: &Path) -> Result<Self, SentinelError> {
        if !path.is_file() {
            return Err(SentinelError::SourceMissing {
                path: path.to_path_buf(),
            });
        }
        let file_size = fs::metadata(path)?.len();
        let file = File::open(path)?;

        let compressed = path.extension().is_some_and(|ext| ext == "zst");
        let inner_name = if compressed {
            path.file_stem().map(|s| s.to_string_lossy().to_string())
        } else {
            path.file_name().map(|s| s.to_string_lossy().to_string())
        }
        .unwrap_or_default();
        let is_dat = inner_name.to_ascii_lowercase().ends_with(".dat");

        let raw: Box<dyn Read + Send> = if compressed {
            let decoder = zstd::stream::read::Decoder::new(file).map_err(|e| {
                SentinelError::SourceDecode {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                }
            })?;
            Box::new(decoder)
        } else {
            Box::new(file)
        };
        let mut stream = BufReader::with_capacity(64 * 1024, raw);

        let delimiter = if is_dat {
            sniff_dat_delimiter(&mut stream)?
        } else {
            Delimiter::Comma
        };
        debug!(?delimiter, compressed, "opening source {}", path.display());

        let (rows, header) = match delimiter {
            Delimiter::Comma | Delimiter::Tab => {
                let byte = if delimiter == Delimiter::Comma {
                    b','
                } else {
                    b'\t'
                };
                let mut reader = ReaderBuilder::new()
                    .delimiter(byte)
                    .trim(Trim::All)
                    .flexible(true)
                    .from_reader(stream);
                let header: Vec<String> = reader
                    .headers()?
                    .iter()
                    .map(|name| name.trim().to_ascii_lowercase())
                    .collect();
                (
                    RowReader::Delimited {
                        reader,
                        record: StringRecord::new(),
                    },
                    header,
                )
            }
            Delimiter::Whitespace => {
                let mut lines = stream.lines();
                let mut header = Vec::new();
                for line in lines.by_ref() {
                    let line = line?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    header = line
                        .split_whitespace()
                        .map(|name| name.to_ascii_lowercase())
                        .collect();
                    break;
                }
                (RowReader::Whitespace { lines }, header)
            }
        };

        if header.is_empty() {
            return Err(SentinelError::MissingColumns {
                columns: vec![
                    "mmsi".to_string(),
                    "timestamp".to_string(),
                    "lat".to_string(),
                    "lon".to_string(),
                ],
            });
        }
        let columns = ColumnMap::from_header(&header)?;

        info!(
            file_size,
            "opened source {} ({} columns)",
            path.display(),
            header.len()
        );

        Ok(Self {
            rows,
            columns,
            stats: LoaderStats::default(),
            file_size,
            row_fields: Vec::new(),
        })
    }

    /// Size of the file on disk (compressed size for `.zst` inputs).
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn stats(&self) -> LoaderStats {
        self.stats
    }

    /// Decode the next valid point, skipping and counting bad rows.
    /// Returns `Ok(None)` at end of input; IO and decode errors propagate.
    pub fn next_point(&mut self) -> Result<Option<AisPoint>, SentinelError> {
        loop {
            if !self.next_row()? {
                return Ok(None);
            }
            match parse_row(&self.row_fields, &self.columns) {
                Ok(point) => {
                    self.stats.parsed += 1;
                    return Ok(Some(point));
                }
                Err(reason) => {
                    self.stats.skipped += 1;
                    debug!("skipping row: {reason}");
                }
            }
        }
    }

    /// Pull up to `max` points. Returns `Ok(None)` once the source is
    /// exhausted.
    pub fn next_chunk(&mut self, max: usize) -> Result<Option<Vec<AisPoint>>, SentinelError> {
        let mut chunk = Vec::with_capacity(max.min(DEFAULT_CHUNK_SIZE));
        while chunk.len() < max {
            match self.next_point()? {
                Some(point) => chunk.push(point),
                None => break,
            }
        }
        if chunk.is_empty() {
            Ok(None)
        } else {
            Ok(Some(chunk))
        }
    }

    /// Buffered mode: decode the whole file into memory, preserving file
    /// order.
    pub fn read_all(&mut self) -> Result<Vec<AisPoint>, SentinelError> {
        let mut points = Vec::new();
        while let Some(point) = self.next_point()? {
            points.push(point);
        }
        Ok(points)
    }

    /// Read the next non-empty row into `self.row_fields`. Returns false
    /// at end of input.
    fn next_row(&mut self) -> Result<bool, SentinelError> {
        self.row_fields.clear();
        match &mut self.rows {
            RowReader::Delimited { reader, record } => {
                if !reader.read_record(record)? {
                    return Ok(false);
                }
                self.row_fields
                    .extend(record.iter().map(|field| field.to_string()));
                Ok(true)
            }
            RowReader::Whitespace { lines } => {
                for line in lines.by_ref() {
                    let line = line?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    self.row_fields
                        .extend(line.split_whitespace().map(|field| field.to_string()));
                    return Ok(true);
                }
                Ok(false)
            }
        }
    }
}

/// Decide between tab and whitespace-run delimiters by peeking at the
/// buffered header line. Nothing is consumed from the stream.
fn sniff_dat_delimiter(stream: &mut RawStream) -> Result<Delimiter, SentinelError> {
    let head = stream.fill_buf()?;
    let line_end = head
        .iter()
        .position(|&b| b == b'\n')
        .unwrap_or(head.len());
    if head[..line_end].contains(&b'\t') {
        Ok(Delimiter::Tab)
    } else {
        Ok(Delimiter::Whitespace)
    }
}

fn parse_row(fields: &[String], columns: &ColumnMap) -> Result<AisPoint, String> {
    let required = |idx: usize, name: &str| -> Result<&str, String> {
        fields
            .get(idx)
            .map(|f| f.as_str())
            .filter(|f| !f.trim().is_empty())
            .ok_or_else(|| format!("missing {name}"))
    };

    let mmsi = Mmsi::try_from(required(columns.mmsi, "mmsi")?)
        .map_err(|e| e.to_string())?;
    let timestamp = parse_timestamp(required(columns.timestamp, "timestamp")?)?;
    let lat = parse_coord(required(columns.lat, "lat")?, "lat")?;
    let lon = parse_coord(required(columns.lon, "lon")?, "lon")?;

    let sog = optional_f64(fields, columns.sog);
    let cog = optional_f64(fields, columns.cog).filter(|c| (0.0..360.0).contains(c));
    let heading = optional_f64(fields, columns.heading)
        .filter(|h| (0.0..360.0).contains(h) || *h == HEADING_UNAVAILABLE);

    Ok(AisPoint {
        mmsi,
        timestamp,
        lat,
        lon,
        sog,
        cog,
        heading,
    })
}

/// Accepts ISO-8601 (with or without zone designator), the common
/// `YYYY-MM-DD HH:MM:SS` form, and numeric epoch seconds. Zone-less
/// timestamps are taken as UTC.
fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    let v = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(v) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(v, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(epoch) = v.parse::<f64>() {
        if epoch.is_finite() {
            if let Some(dt) = DateTime::from_timestamp_millis((epoch * 1000.0).round() as i64) {
                return Ok(dt);
            }
        }
    }
    Err(format!("unparseable timestamp {v:?}"))
}

fn parse_coord(value: &str, name: &str) -> Result<f64, String> {
    let parsed: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("unparseable {name} {value:?}"))?;
    if parsed.is_finite() {
        Ok(parsed)
    } else {
        Err(format!("non-finite {name}"))
    }
}

/// Empty or unparseable optional fields become null.
fn optional_f64(fields: &[String], idx: Option<usize>) -> Option<f64> {
    let raw = fields.get(idx?)?.trim();
    if raw.is_empty() {
        return None;
    }
    raw.parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn reads_basic_csv() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "points.csv",
            "mmsi,timestamp,lat,lon,sog,cog,heading\n\
             230123456,2025-01-01T00:00:00,60.1,24.9,10.5,180.0,181.0\n\
             230123456,2025-01-01 00:01:00,60.2,24.8,,,\n",
        );
        let mut source = PointSource::open(&path).unwrap();
        let points = source.read_all().unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].mmsi.as_str(), "230123456");
        assert_eq!(points[0].sog, Some(10.5));
        assert_eq!(points[1].sog, None);
        assert_eq!(points[1].timestamp.timestamp(), points[0].timestamp.timestamp() + 60);
        assert_eq!(source.stats().parsed, 2);
        assert_eq!(source.stats().skipped, 0);
    }

    #[test]
    fn matches_marine_cadastre_aliases() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "points.csv",
            "MMSI,BaseDateTime,LAT,LON,SOG,COG,Heading\n\
             367000001,2025-01-01T00:00:00,29.9,-90.1,8.0,45.0,511\n",
        );
        let mut source = PointSource::open(&path).unwrap();
        let points = source.read_all().unwrap();
        assert_eq!(points.len(), 1);
        // 511 survives the loader; the rules treat it as unavailable
        assert_eq!(points[0].heading, Some(511.0));
        assert_eq!(points[0].heading_deg(), None);
    }

    #[test]
    fn skips_unparseable_rows_and_counts_them() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "points.csv",
            "mmsi,timestamp,lat,lon\n\
             230123456,2025-01-01T00:00:00,60.1,24.9\n\
             notanmmsi,2025-01-01T00:00:10,60.1,24.9\n\
             230123456,yesterday,60.1,24.9\n\
             230123456,2025-01-01T00:00:30,sixty,24.9\n\
             230123456,2025-01-01T00:00:40,60.4,24.6\n",
        );
        let mut source = PointSource::open(&path).unwrap();
        let points = source.read_all().unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(source.stats().skipped, 3);
    }

    #[test]
    fn missing_required_column_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "points.csv",
            "mmsi,timestamp,lat\n230123456,2025-01-01T00:00:00,60.1\n",
        );
        match PointSource::open(&path) {
            Err(SentinelError::MissingColumns { columns }) => {
                assert_eq!(columns, vec!["lon".to_string()]);
            }
            other => panic!("expected MissingColumns, got {other:?}"),
        }
    }

    #[test]
    fn missing_file_is_fatal() {
        assert!(matches!(
            PointSource::open(Path::new("/nonexistent/points.csv")),
            Err(SentinelError::SourceMissing { .. })
        ));
    }

    #[test]
    fn reads_tab_delimited_dat() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "points.dat",
            "mmsi\ttimestamp\tlat\tlon\n230123456\t2025-01-01T00:00:00\t60.1\t24.9\n",
        );
        let mut source = PointSource::open(&path).unwrap();
        assert_eq!(source.read_all().unwrap().len(), 1);
    }

    #[test]
    fn reads_whitespace_delimited_dat() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "points.dat",
            "mmsi  timestamp  lat  lon\n230123456   2025-01-01T00:00:00  60.1   24.9\n",
        );
        let mut source = PointSource::open(&path).unwrap();
        let points = source.read_all().unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].lat, 60.1);
    }

    #[test]
    fn reads_zstd_compressed_csv() {
        let dir = TempDir::new().unwrap();
        let raw = "mmsi,timestamp,lat,lon\n230123456,2025-01-01T00:00:00,60.1,24.9\n";
        let path = dir.path().join("points.csv.zst");
        let file = File::create(&path).unwrap();
        let mut encoder = zstd::stream::write::Encoder::new(file, 3).unwrap();
        encoder.write_all(raw.as_bytes()).unwrap();
        encoder.finish().unwrap();

        let mut source = PointSource::open(&path).unwrap();
        let points = source.read_all().unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].lon, 24.9);
    }

    #[test]
    fn chunked_reads_cover_the_file() {
        let dir = TempDir::new().unwrap();
        let mut contents = String::from("mmsi,timestamp,lat,lon\n");
        for i in 0..25 {
            contents.push_str(&format!("230123456,2025-01-01T00:00:{i:02},60.1,24.9\n"));
        }
        let path = write_file(&dir, "points.csv", &contents);
        let mut source = PointSource::open(&path).unwrap();
        let mut total = 0;
        let mut chunks = 0;
        while let Some(chunk) = source.next_chunk(10).unwrap() {
            assert!(chunk.len() <= 10);
            total += chunk.len();
            chunks += 1;
        }
        assert_eq!(total, 25);
        assert_eq!(chunks, 3);
    }

    #[test]
    fn header_only_file_yields_no_points() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "points.csv", "mmsi,timestamp,lat,lon\n");
        let mut source = PointSource::open(&path).unwrap();
        assert!(source.next_chunk(100).unwrap().is_none());
        assert_eq!(source.stats(), LoaderStats::default());
    }

    #[test]
    fn epoch_timestamps_are_accepted() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "points.csv",
            "mmsi,time,lat,lon\n230123456,1735689600,60.1,24.9\n",
        );
        let mut source = PointSource::open(&path).unwrap();
        let points = source.read_all().unwrap();
        assert_eq!(points[0].timestamp.timestamp(), 1_735_689_600);
    }

    #[test]
    fn out_of_range_angles_become_null() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "points.csv",
            "mmsi,timestamp,lat,lon,cog,heading\n\
             230123456,2025-01-01T00:00:00,60.1,24.9,380.0,400.0\n",
        );
        let mut source = PointSource::open(&path).unwrap();
        let points = source.read_all().unwrap();
        assert_eq!(points[0].cog, None);
        assert_eq!(points[0].heading, None);
    }

    #[test]
    fn out_of_bounds_coordinates_pass_through() {
        // Range checking is the detection engine's job, not the loader's.
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "points.csv",
            "mmsi,timestamp,lat,lon\n230123456,2025-01-01T00:00:00,95.0,0.0\n",
        );
        let mut source = PointSource::open(&path).unwrap();
        let points = source.read_all().unwrap();
        assert_eq!(points[0].lat, 95.0);
    }
}
