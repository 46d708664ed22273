//! 记忆记录：四类载荷（语义 / 情景 / 程序 / 指令）+ 公共信封
//!
//! 载荷写入后不可变；只有 mention_count、last_verified 与 flags 会在去重合并时更新。
//! 去重键 = 记录种类 + 种类相关的身份字段，在命名空间内唯一。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 命名空间：有序字符串元组，检索与整理从不隐式跨越命名空间
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace(Vec<String>);

impl Namespace {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// 全局语义记忆（所有 agent/user/task 共享）
    pub fn semantic() -> Self {
        Self::new(["semantic"])
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

/// (agent, user, task) 作用域，派生出四个标准命名空间
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryScope {
    pub agent_id: String,
    pub user_id: String,
    pub task_id: String,
}

impl MemoryScope {
    pub fn new(
        agent_id: impl Into<String>,
        user_id: impl Into<String>,
        task_id: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            user_id: user_id.into(),
            task_id: task_id.into(),
        }
    }

    pub fn semantic(&self) -> Namespace {
        Namespace::semantic()
    }

    pub fn episodes(&self) -> Namespace {
        Namespace::new([format!("{}_episodes_{}", self.agent_id, self.user_id)])
    }

    pub fn instructions(&self) -> Namespace {
        Namespace::new([format!(
            "{}_instructions_{}_{}",
            self.agent_id, self.user_id, self.task_id
        )])
    }

    pub fn procedures(&self) -> Namespace {
        Namespace::new([format!(
            "{}_procedures_{}_{}",
            self.agent_id, self.user_id, self.task_id
        )])
    }

    pub fn namespaces(&self) -> [Namespace; 4] {
        [
            self.semantic(),
            self.episodes(),
            self.instructions(),
            self.procedures(),
        ]
    }
}

impl Default for MemoryScope {
    fn default() -> Self {
        Self::new("supervisor", "default", "default")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Semantic,
    Episodic,
    Procedural,
    Instruction,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Semantic => "semantic",
            MemoryKind::Episodic => "episodic",
            MemoryKind::Procedural => "procedural",
            MemoryKind::Instruction => "instruction",
        }
    }
}

/// 用户显式标记，提升记录的显著性
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryFlag {
    pub user_id: String,
    pub score: f64,
    pub locked: bool,
    pub flag_type: String,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

impl MemoryFlag {
    pub fn new(user_id: impl Into<String>, flag_type: impl Into<String>, score: f64) -> Self {
        Self {
            user_id: user_id.into(),
            score,
            locked: false,
            flag_type: flag_type.into(),
            description: String::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn locked(mut self) -> Self {
        self.locked = true;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    fn same_slot(&self, other: &MemoryFlag) -> bool {
        self.user_id == other.user_id && self.flag_type == other.flag_type
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemoryPayload {
    Semantic {
        topic: String,
        fact: String,
        source: String,
    },
    Episodic {
        timestamp: DateTime<Utc>,
        convo_id: String,
        speaker: String,
        text: String,
    },
    Procedural {
        task_id: String,
        steps: Vec<Value>,
        outcome: String,
        feedback: String,
    },
    Instruction {
        task_id: String,
        task: String,
        instructions: String,
    },
}

/// 去重键字段分隔符（不会出现在正常文本中）
const KEY_SEP: char = '\u{1f}';

impl MemoryPayload {
    pub fn kind(&self) -> MemoryKind {
        match self {
            MemoryPayload::Semantic { .. } => MemoryKind::Semantic,
            MemoryPayload::Episodic { .. } => MemoryKind::Episodic,
            MemoryPayload::Procedural { .. } => MemoryKind::Procedural,
            MemoryPayload::Instruction { .. } => MemoryKind::Instruction,
        }
    }

    /// 种类相关的身份字段（精确匹配）
    fn identity(&self) -> Vec<String> {
        match self {
            MemoryPayload::Semantic { topic, fact, .. } => vec![topic.clone(), fact.clone()],
            MemoryPayload::Episodic {
                convo_id,
                speaker,
                text,
                ..
            } => vec![convo_id.clone(), speaker.clone(), text.clone()],
            MemoryPayload::Procedural {
                task_id,
                steps,
                outcome,
                ..
            } => vec![
                task_id.clone(),
                Value::Array(steps.clone()).to_string(),
                outcome.clone(),
            ],
            MemoryPayload::Instruction {
                task_id,
                task,
                instructions,
            } => vec![task_id.clone(), task.clone(), instructions.clone()],
        }
    }

    /// 供相似度索引的文本
    pub fn content_text(&self) -> String {
        match self {
            MemoryPayload::Semantic { topic, fact, .. } => format!("{topic}: {fact}"),
            MemoryPayload::Episodic { speaker, text, .. } => format!("{speaker}: {text}"),
            MemoryPayload::Procedural {
                task_id,
                steps,
                outcome,
                ..
            } => format!("{task_id}: {} -> {outcome}", Value::Array(steps.clone())),
            MemoryPayload::Instruction {
                task, instructions, ..
            } => format!("{task}: {instructions}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub namespace: Namespace,
    pub created_at: DateTime<Utc>,
    pub mention_count: u32,
    pub last_verified: DateTime<Utc>,
    #[serde(default)]
    pub flags: Vec<MemoryFlag>,
    pub payload: MemoryPayload,
}

impl MemoryRecord {
    pub fn new(namespace: Namespace, payload: MemoryPayload) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            namespace,
            created_at: now,
            mention_count: 1,
            last_verified: now,
            flags: Vec::new(),
            payload,
        }
    }

    pub fn semantic(
        namespace: Namespace,
        topic: impl Into<String>,
        fact: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self::new(
            namespace,
            MemoryPayload::Semantic {
                topic: topic.into(),
                fact: fact.into(),
                source: source.into(),
            },
        )
    }

    pub fn episodic(
        namespace: Namespace,
        convo_id: impl Into<String>,
        speaker: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self::new(
            namespace,
            MemoryPayload::Episodic {
                timestamp: Utc::now(),
                convo_id: convo_id.into(),
                speaker: speaker.into(),
                text: text.into(),
            },
        )
    }

    pub fn procedural(
        namespace: Namespace,
        task_id: impl Into<String>,
        steps: Vec<Value>,
        outcome: impl Into<String>,
    ) -> Self {
        Self::new(
            namespace,
            MemoryPayload::Procedural {
                task_id: task_id.into(),
                steps,
                outcome: outcome.into(),
                feedback: String::new(),
            },
        )
    }

    pub fn instruction(
        namespace: Namespace,
        task_id: impl Into<String>,
        task: impl Into<String>,
        instructions: impl Into<String>,
    ) -> Self {
        Self::new(
            namespace,
            MemoryPayload::Instruction {
                task_id: task_id.into(),
                task: task.into(),
                instructions: instructions.into(),
            },
        )
    }

    pub fn with_flag(mut self, flag: MemoryFlag) -> Self {
        self.merge_flags(std::slice::from_ref(&flag));
        self
    }

    pub fn with_mentions(mut self, mention_count: u32) -> Self {
        self.mention_count = mention_count;
        self
    }

    /// 同时调整 created_at 与 last_verified（情景记忆的 timestamp 亦随之调整）
    pub fn with_timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.last_verified = at;
        if let MemoryPayload::Episodic { timestamp, .. } = &mut self.payload {
            *timestamp = at;
        }
        self
    }

    pub fn kind(&self) -> MemoryKind {
        self.payload.kind()
    }

    /// 命名空间内的去重键
    pub fn dedupe_key(&self) -> String {
        let mut key = String::from(self.kind().as_str());
        for part in self.payload.identity() {
            key.push(KEY_SEP);
            key.push_str(&part);
        }
        key
    }

    /// 近因衰减的参考时间：情景记忆用自身 timestamp，其余用 last_verified
    pub fn age_reference(&self) -> DateTime<Utc> {
        match &self.payload {
            MemoryPayload::Episodic { timestamp, .. } => *timestamp,
            _ => self.last_verified,
        }
    }

    /// 重复写入：计数 +1、刷新 last_verified、合并新 flag
    pub fn record_mention(&mut self, now: DateTime<Utc>, flags: &[MemoryFlag]) {
        self.mention_count = self.mention_count.saturating_add(1);
        if now > self.last_verified {
            self.last_verified = now;
        }
        self.merge_flags(flags);
    }

    /// 整理时吸收重复记录：计数相加、取较新 last_verified 与较早 created_at
    pub fn absorb(&mut self, other: &MemoryRecord) {
        self.mention_count = self.mention_count.saturating_add(other.mention_count);
        self.last_verified = self.last_verified.max(other.last_verified);
        self.created_at = self.created_at.min(other.created_at);
        self.merge_flags(&other.flags);
    }

    /// 同一 (user_id, flag_type) 的 flag 以新换旧，其余追加
    pub fn merge_flags(&mut self, flags: &[MemoryFlag]) {
        for flag in flags {
            match self.flags.iter_mut().find(|f| f.same_slot(flag)) {
                Some(existing) => *existing = flag.clone(),
                None => self.flags.push(flag.clone()),
            }
        }
    }
}
