//! Append-only JSONL log for perceptual blocks
//!
//! One file per chat. Every mutation appends a record; removals append a
//! tombstone, so already-written lines are never touched and a crash can only
//! lose the tail. The live set is reconstructed by replaying the log.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::config::MemoryConfig;
use crate::error::Result;
use crate::perceptual::MemoryBlock;

/// One line in the block log
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum BlockRecord {
    Upsert { block: MemoryBlock },
    Remove { id: Uuid },
}

/// JSONL storage backend for perceptual blocks
pub struct BlockLog {
    base_path: PathBuf,
}

impl BlockLog {
    /// Create a new block log rooted at the configured data directory
    pub fn new(config: &MemoryConfig) -> Result<Self> {
        let base_path = config.data_dir.join("blocks");
        std::fs::create_dir_all(&base_path)?;

        Ok(Self { base_path })
    }

    fn log_path(&self, chat_id: &str) -> PathBuf {
        self.base_path.join(format!("{}.jsonl", sanitize(chat_id)))
    }

    /// Append an upsert record for a block
    pub fn append(&self, block: &MemoryBlock) -> Result<()> {
        self.append_record(&block.chat_id, &BlockRecord::Upsert {
            block: block.clone(),
        })
    }

    /// Append a tombstone for a removed block
    pub fn append_remove(&self, chat_id: &str, id: Uuid) -> Result<()> {
        self.append_record(chat_id, &BlockRecord::Remove { id })
    }

    fn append_record(&self, chat_id: &str, record: &BlockRecord) -> Result<()> {
        let path = self.log_path(chat_id);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;

        let json = serde_json::to_string(record)?;
        writeln!(file, "{}", json)?;
        Ok(())
    }

    /// Replay the log for a chat into its live blocks, oldest first.
    ///
    /// A corrupt tail line (partial write from a crash) is skipped with a
    /// warning rather than failing the load.
    pub fn load_chat(&self, chat_id: &str) -> Result<Vec<MemoryBlock>> {
        let path = self.log_path(chat_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path)?;
        let reader = BufReader::new(file);

        let mut live: Vec<MemoryBlock> = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<BlockRecord>(&line) {
                Ok(BlockRecord::Upsert { block }) => {
                    live.retain(|b| b.id != block.id);
                    live.push(block);
                }
                Ok(BlockRecord::Remove { id }) => {
                    live.retain(|b| b.id != id);
                }
                Err(e) => {
                    warn!(chat_id, error = %e, "skipping corrupt block log line");
                }
            }
        }

        live.sort_by_key(|b| b.created_at);
        Ok(live)
    }

    /// Rewrite a chat's log to just its live blocks (startup compaction)
    pub fn compact_chat(&self, chat_id: &str, blocks: &[MemoryBlock]) -> Result<()> {
        let path = self.log_path(chat_id);
        let tmp = path.with_extension("jsonl.tmp");

        {
            let mut file = File::create(&tmp)?;
            for block in blocks {
                let record = BlockRecord::Upsert {
                    block: block.clone(),
                };
                writeln!(file, "{}", serde_json::to_string(&record)?)?;
            }
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// List all chats with a block log
    pub fn list_chats(&self) -> Result<Vec<String>> {
        if !self.base_path.exists() {
            return Ok(Vec::new());
        }

        let mut chats = Vec::new();
        for entry in std::fs::read_dir(&self.base_path)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map(|e| e == "jsonl").unwrap_or(false) {
                if let Some(stem) = path.file_stem() {
                    chats.push(stem.to_string_lossy().to_string());
                }
            }
        }

        Ok(chats)
    }
}

/// Chat ids become file names; anything outside a safe set is replaced.
fn sanitize(chat_id: &str) -> String {
    chat_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn make_log() -> (tempfile::TempDir, BlockLog) {
        let dir = tempfile::tempdir().unwrap();
        let config = MemoryConfig::with_data_dir(dir.path());
        let log = BlockLog::new(&config).unwrap();
        (dir, log)
    }

    fn make_block(chat_id: &str) -> MemoryBlock {
        let mut block = MemoryBlock::new(chat_id);
        block.messages.push(Message::new(chat_id, "alice", "hello"));
        block
    }

    #[test]
    fn append_and_replay() {
        let (_dir, log) = make_log();
        let block = make_block("chat-a");
        log.append(&block).unwrap();

        let loaded = log.load_chat("chat-a").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, block.id);
        assert_eq!(loaded[0].messages.len(), 1);
    }

    #[test]
    fn upsert_replaces_previous_record() {
        let (_dir, log) = make_log();
        let mut block = make_block("chat-a");
        log.append(&block).unwrap();

        block.messages.push(Message::new("chat-a", "bob", "hi back"));
        log.append(&block).unwrap();

        let loaded = log.load_chat("chat-a").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].messages.len(), 2);
    }

    #[test]
    fn tombstone_removes_block() {
        let (_dir, log) = make_log();
        let block = make_block("chat-a");
        log.append(&block).unwrap();
        log.append_remove("chat-a", block.id).unwrap();

        assert!(log.load_chat("chat-a").unwrap().is_empty());
    }

    #[test]
    fn corrupt_tail_line_is_skipped() {
        let (dir, log) = make_log();
        let block = make_block("chat-a");
        log.append(&block).unwrap();

        // Simulate a crash mid-write
        let path = dir
            .path()
            .join("blocks")
            .join("chat-a.jsonl");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "{{\"op\":\"upsert\",\"blo").unwrap();

        let loaded = log.load_chat("chat-a").unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[test]
    fn missing_chat_is_empty() {
        let (_dir, log) = make_log();
        assert!(log.load_chat("nope").unwrap().is_empty());
    }

    #[test]
    fn compact_rewrites_live_set() {
        let (_dir, log) = make_log();
        let first = make_block("chat-a");
        let second = make_block("chat-a");
        log.append(&first).unwrap();
        log.append(&second).unwrap();
        log.append_remove("chat-a", first.id).unwrap();

        let live = log.load_chat("chat-a").unwrap();
        log.compact_chat("chat-a", &live).unwrap();

        let reloaded = log.load_chat("chat-a").unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded[0].id, second.id);
    }

    #[test]
    fn list_chats_finds_logs() {
        let (_dir, log) = make_log();
        log.append(&make_block("chat-a")).unwrap();
        log.append(&make_block("chat-b")).unwrap();

        let mut chats = log.list_chats().unwrap();
        chats.sort();
        assert_eq!(chats, vec!["chat-a", "chat-b"]);
    }
}
