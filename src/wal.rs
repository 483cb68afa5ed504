use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Events per record when writing a compacted snapshot.
const COMPACT_CHUNK: usize = 1024;

/// Encode one record (all events of one commit) as `[len][bincode][crc32]`.
fn encode_record(writer: &mut impl Write, events: &[Event]) -> io::Result<()> {
    let payload =
        bincode::serialize(events).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "WAL record too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Append-only Write-Ahead Log.
///
/// Format per record: `[u32: len][bincode: Vec<Event>][u32: crc32]`
/// - One record per committed unit of work, so a transaction replays whole or not at all.
/// - A truncated or corrupt trailing record (crash mid-write) is discarded on replay.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, events: &[Event]) -> io::Result<()> {
        self.append_buffered(events)?;
        self.flush_sync()
    }

    /// Buffer one record without syncing. `flush_sync()` commits the batch.
    pub fn append_buffered(&mut self, events: &[Event]) -> io::Result<()> {
        encode_record(&mut self.writer, events)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a snapshot to the temp file and fsync.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for chunk in events.chunks(COMPACT_CHUNK) {
            encode_record(&mut writer, chunk)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Rename the temp file over the WAL and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL, returning the events of every complete record in order.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut records = 0usize;

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                tracing::warn!("WAL {}: bad checksum after {records} records, truncating replay", path.display());
                break;
            }

            match bincode::deserialize::<Vec<Event>>(&payload) {
                Ok(record) => {
                    events.extend(record);
                    records += 1;
                }
                Err(_) => break,
            }
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("studiodb_test_wal");
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn room() -> Event {
        Event::ResourceCreated {
            id: Ulid::new(),
            kind: ResourceKind::Room,
            name: None,
        }
    }

    fn balance(client_id: Ulid, balance_cents: i64) -> Event {
        Event::UnpaidBalanceSet {
            client_id,
            balance_cents,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let _ = fs::remove_file(&path);

        let client = Ulid::new();
        let first = vec![room(), Event::ClientCreated { id: client, name: None }];
        let second = vec![balance(client, 1500)];

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
            wal.append(&second).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        let expected: Vec<Event> = first.into_iter().chain(second).collect();
        assert_eq!(replayed, expected);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn torn_record_is_dropped_whole() {
        let path = tmp_path("torn_record.wal");
        let _ = fs::remove_file(&path);

        let committed = vec![room()];
        let client = Ulid::new();
        let torn = vec![balance(client, 100), balance(client, 200), room()];

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&committed).unwrap();
        }
        // Simulate a crash halfway through writing the second record.
        {
            let mut buf = Vec::new();
            encode_record(&mut buf, &torn).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&buf[..buf.len() / 2]).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, committed);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let _ = fs::remove_file(&path);
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let _ = fs::remove_file(&path);

        {
            let payload = bincode::serialize(&vec![room()]).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }

        assert!(Wal::replay(&path).unwrap().is_empty());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_shrinks_and_accepts_appends() {
        let path = tmp_path("compact.wal");
        let _ = fs::remove_file(&path);

        let client = Ulid::new();
        let created = Event::ClientCreated { id: client, name: Some("Ada".into()) };
        let mut wal = Wal::open(&path).unwrap();
        wal.append(std::slice::from_ref(&created)).unwrap();
        for cents in 0..50 {
            wal.append(&[balance(client, cents)]).unwrap();
        }
        let before = fs::metadata(&path).unwrap().len();

        let snapshot = vec![created.clone(), balance(client, 49)];
        wal.compact(&snapshot).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");

        let tail = balance(client, 0);
        wal.append(std::slice::from_ref(&tail)).unwrap();
        drop(wal);

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![created, balance(client, 49), tail]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn large_snapshot_is_chunked() {
        let path = tmp_path("chunked.wal");
        let _ = fs::remove_file(&path);

        let events: Vec<Event> = (0..COMPACT_CHUNK * 2 + 7).map(|_| room()).collect();
        Wal::write_compact_file(&path, &events).unwrap();
        fs::rename(path.with_extension("wal.tmp"), &path).unwrap();

        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_buffered_then_flush_sync() {
        let path = tmp_path("buffered_flush.wal");
        let _ = fs::remove_file(&path);

        let records: Vec<Vec<Event>> = (0..5).map(|_| vec![room()]).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for r in &records {
                wal.append_buffered(r).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, records.concat());
        let _ = fs::remove_file(&path);
    }
}
