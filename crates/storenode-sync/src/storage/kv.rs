//! 基于 sled 的同步簿记存储
//!
//! Tree 划分：
//! - `topic_sync`：`{pubsub_topic}\0{content_topic_hex}` -> TopicSyncState
//! - `chats`：chat_id -> ChatSyncRecord
//! - `messages`：gap message id -> GapMessage
//! - `targets`：`{kind}:{id}` -> 目标原始数据

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, Tree};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::storage::SyncStore;
use crate::types::{ChatSyncRecord, FetchTarget, GapMessage, TopicSyncState};

const TOPIC_SYNC_TREE: &str = "topic_sync";
const CHATS_TREE: &str = "chats";
const MESSAGES_TREE: &str = "messages";
const TARGETS_TREE: &str = "targets";

const OPEN_ATTEMPTS: u32 = 5;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// 打开 sled 数据库
///
/// 同一目录的上一个实例可能还没释放文件锁，IO 错误按指数退避重试；
/// 其他错误（数据损坏等）直接返回。
async fn open_db(path: &Path) -> Result<Db> {
    let mut attempt = 0;
    loop {
        match sled::open(path) {
            Ok(db) => return Ok(db),
            Err(sled::Error::Io(e)) if attempt + 1 < OPEN_ATTEMPTS => {
                let delay = OPEN_RETRY_DELAY * (1 << attempt);
                debug!("打开 sled 数据库失败，{:?} 后重试: attempt={}, error={}", delay, attempt + 1, e);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(SyncError::KvStore(format!("打开 sled 数据库失败: {}", e))),
        }
    }
}

/// sled 版同步存储
#[derive(Debug)]
pub struct KvSyncStore {
    base_path: PathBuf,
    db: Db,
    topics: Tree,
    chats: Tree,
    messages: Tree,
    targets: Tree,
}

impl KvSyncStore {
    /// 打开（或创建）存储
    pub async fn open(base_path: &Path) -> Result<Self> {
        let base_path = base_path.to_path_buf();
        let kv_path = base_path.join("sync_kv");

        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| SyncError::Persistence(format!("创建 KV 存储目录失败: {}", e)))?;

        let db = open_db(&kv_path).await?;

        let topics = db.open_tree(TOPIC_SYNC_TREE)?;
        let chats = db.open_tree(CHATS_TREE)?;
        let messages = db.open_tree(MESSAGES_TREE)?;
        let targets = db.open_tree(TARGETS_TREE)?;

        info!("同步 KV 存储已打开: {}", kv_path.display());

        Ok(Self {
            base_path,
            db,
            topics,
            chats,
            messages,
            targets,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// 写入聊天记录（包括阅读时间）
    pub fn upsert_chat(&self, record: &ChatSyncRecord) -> Result<()> {
        put_json(&self.chats, record.chat_id.as_bytes(), record)
    }

    /// 下层把目标数据写入本地
    pub fn put_target(&self, target: &FetchTarget, data: &[u8]) -> Result<()> {
        self.targets.insert(target_key(target), data)?;
        Ok(())
    }

    /// 刷盘
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

fn topic_key(state: &TopicSyncState) -> Vec<u8> {
    let mut key = state.pubsub_topic.as_bytes().to_vec();
    key.push(0);
    key.extend_from_slice(state.content_topic.to_hex().as_bytes());
    key
}

fn target_key(target: &FetchTarget) -> Vec<u8> {
    target.to_string().into_bytes()
}

fn put_json<V: Serialize>(tree: &Tree, key: &[u8], value: &V) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    tree.insert(key, bytes)?;
    Ok(())
}

fn get_json<V: DeserializeOwned>(tree: &Tree, key: &[u8]) -> Result<Option<V>> {
    match tree.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

#[async_trait]
impl SyncStore for KvSyncStore {
    async fn load_topic_sync_states(&self) -> Result<Vec<TopicSyncState>> {
        let mut states = Vec::new();
        for item in self.topics.iter() {
            let (_, value) = item?;
            states.push(serde_json::from_slice(&value)?);
        }
        Ok(states)
    }

    async fn persist_topic_sync_states(&self, states: &[TopicSyncState]) -> Result<()> {
        let mut batch = sled::Batch::default();
        for state in states {
            batch.insert(topic_key(state), serde_json::to_vec(state)?);
        }
        self.topics.apply_batch(batch)?;
        debug!("已保存 {} 条 topic 同步状态", states.len());
        Ok(())
    }

    async fn chat_sync_record(&self, chat_id: &str) -> Result<Option<ChatSyncRecord>> {
        get_json(&self.chats, chat_id.as_bytes())
    }

    async fn set_chat_sync_markers(&self, chat_id: &str, from: u64, to: u64) -> Result<()> {
        let mut record: ChatSyncRecord =
            get_json(&self.chats, chat_id.as_bytes())?.unwrap_or_else(|| ChatSyncRecord::new(chat_id));
        record.synced_from = from;
        record.synced_to = to;
        put_json(&self.chats, chat_id.as_bytes(), &record)
    }

    async fn persist_messages(&self, messages: &[GapMessage]) -> Result<()> {
        let mut batch = sled::Batch::default();
        for message in messages {
            batch.insert(message.id.as_bytes(), serde_json::to_vec(message)?);
        }
        self.messages.apply_batch(batch)?;
        Ok(())
    }

    async fn delete_messages(&self, ids: &[String]) -> Result<()> {
        let mut batch = sled::Batch::default();
        for id in ids {
            batch.remove(id.as_bytes());
        }
        self.messages.apply_batch(batch)?;
        Ok(())
    }

    async fn gap_messages(&self, chat_id: &str, ids: &[String]) -> Result<Vec<GapMessage>> {
        let mut gaps = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(gap) = get_json::<GapMessage>(&self.messages, id.as_bytes())? {
                if gap.chat_id == chat_id {
                    gaps.push(gap);
                }
            }
        }
        Ok(gaps)
    }

    fn has_target(&self, target: &FetchTarget) -> bool {
        match self.targets.contains_key(target_key(target)) {
            Ok(found) => found,
            Err(e) => {
                warn!("检查目标数据失败，按不存在处理: target={}, error={}", target, e);
                false
            }
        }
    }

    async fn load_target(&self, target: &FetchTarget) -> Result<Option<Bytes>> {
        Ok(self
            .targets
            .get(target_key(target))?
            .map(|v| Bytes::copy_from_slice(&v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ContentTopic;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_topic_states_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let state = TopicSyncState {
            pubsub_topic: "/waku/2/rs/16/32".into(),
            content_topic: ContentTopic::from_bytes(vec![0xde, 0xad, 0xbe, 0xef]),
            last_request: 1_700_000_000,
        };

        {
            let store = KvSyncStore::open(temp_dir.path()).await.unwrap();
            store.persist_topic_sync_states(&[state.clone()]).await.unwrap();
            store.flush().await.unwrap();
        }

        let store = KvSyncStore::open(temp_dir.path()).await.unwrap();
        let states = store.load_topic_sync_states().await.unwrap();
        assert_eq!(states, vec![state]);
    }

    #[tokio::test]
    async fn test_chat_markers_keep_read_time() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvSyncStore::open(temp_dir.path()).await.unwrap();

        let mut record = ChatSyncRecord::new("chat-1");
        record.read_messages_at = 42;
        store.upsert_chat(&record).unwrap();

        store.set_chat_sync_markers("chat-1", 100, 200).await.unwrap();
        let loaded = store.chat_sync_record("chat-1").await.unwrap().unwrap();
        assert_eq!(loaded.synced_from, 100);
        assert_eq!(loaded.synced_to, 200);
        assert_eq!(loaded.read_messages_at, 42);

        assert!(store.chat_sync_record("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_gap_messages_and_targets() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvSyncStore::open(temp_dir.path()).await.unwrap();

        let gap = GapMessage {
            id: "gap-1".into(),
            chat_id: "chat-1".into(),
            from: 50,
            to: 100,
            clock: 100_000,
        };
        store.persist_messages(&[gap.clone()]).await.unwrap();
        let ids = vec!["gap-1".to_string()];
        assert_eq!(store.gap_messages("chat-1", &ids).await.unwrap(), vec![gap]);

        store.delete_messages(&ids).await.unwrap();
        assert!(store.gap_messages("chat-1", &ids).await.unwrap().is_empty());

        let target = FetchTarget::Community("c1".into());
        assert!(!store.has_target(&target));
        store.put_target(&target, b"description").unwrap();
        assert!(store.has_target(&target));
        assert_eq!(
            store.load_target(&target).await.unwrap(),
            Some(Bytes::from_static(b"description"))
        );
    }

    #[tokio::test]
    async fn test_open_locked_directory_fails_after_retries() {
        let temp_dir = TempDir::new().unwrap();
        let _held = KvSyncStore::open(temp_dir.path()).await.unwrap();

        let started = std::time::Instant::now();
        let err = KvSyncStore::open(temp_dir.path()).await.unwrap_err();
        assert!(matches!(err, SyncError::KvStore(_)));
        // 锁冲突是 IO 错误，放弃前经过了退避重试
        assert!(started.elapsed() >= OPEN_RETRY_DELAY);
    }
}
