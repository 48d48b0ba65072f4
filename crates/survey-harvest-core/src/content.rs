//! Content-addressed landing of accepted payloads.
//!
//! [`ContentStore`] owns the record collection and the hash index. Both are
//! rebuilt on open by replaying an append-only JSON-lines ledger, so every
//! landing, supersession and corruption mark stays auditable. All
//! mutations run under one async lock, which keeps concurrent workers from
//! losing each other's updates.
//!
//! Layout under the store root:
//!
//! ```text
//! raw/2024/02/week_07/sentinel_weekly_age_2024_07.csv
//! raw/2024/02/week_07/sentinel_weekly_age_2024_07.meta.json
//! raw/.metadata/records.jsonl
//! raw/.metadata/hash_index.json
//! raw/.metadata/superseded/...
//! quarantine/sentinel_weekly_age/...
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::backlog::month_of_week;
use crate::error::StoreError;
use crate::models::{
    FileRecord, PayloadStats, PeriodKey, PeriodKind, QualityVerdict, RecordStatus, WorkItem,
};
use crate::quality::{HistoricalBaseline, QuarantineReason};
use crate::store::ObjectStore;

/// SHA-256 of the payload bytes as lowercase hex.
pub fn compute_hash(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    format!("{:x}", hasher.finalize())
}

/// Directory names inside the store root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreLayout {
    pub data_dir: String,
    pub quarantine_dir: String,
    pub metadata_dir: String,
}

impl Default for StoreLayout {
    fn default() -> Self {
        Self {
            data_dir: "raw".to_string(),
            quarantine_dir: "quarantine".to_string(),
            metadata_dir: "raw/.metadata".to_string(),
        }
    }
}

impl StoreLayout {
    /// `{data}/{year}/{month}` for monthly tables and
    /// `{data}/{year}/{month}/week_{week}` for weekly ones, where a week
    /// belongs to the month of its Monday.
    pub fn period_dir(&self, kind: PeriodKind, key: PeriodKey) -> String {
        match kind {
            PeriodKind::Monthly => format!("{}/{}/{:02}", self.data_dir, key.year, key.index),
            PeriodKind::Weekly => format!(
                "{}/{}/{:02}/week_{:02}",
                self.data_dir,
                key.year,
                month_of_week(key.year, key.index),
                key.index
            ),
        }
    }

    pub fn payload_path(&self, item: &WorkItem) -> String {
        format!(
            "{}/{}.csv",
            self.period_dir(item.period_kind, item.period_key),
            item.logical_name()
        )
    }

    pub fn meta_path(&self, item: &WorkItem) -> String {
        format!(
            "{}/{}.meta.json",
            self.period_dir(item.period_kind, item.period_key),
            item.logical_name()
        )
    }

    fn record_meta_path(&self, record: &FileRecord) -> String {
        format!(
            "{}/{}.meta.json",
            self.period_dir(record.period_kind, record.period_key),
            record.logical_name
        )
    }

    pub fn ledger_path(&self) -> String {
        format!("{}/records.jsonl", self.metadata_dir)
    }

    pub fn index_path(&self) -> String {
        format!("{}/hash_index.json", self.metadata_dir)
    }

    fn archive_path(&self, logical_name: &str, hash: &str, at: DateTime<Utc>) -> String {
        format!(
            "{}/superseded/{}_{}_{}.csv",
            self.metadata_dir,
            logical_name,
            at.format("%Y%m%dT%H%M%SZ"),
            short_hash(hash)
        )
    }

    fn quarantine_stem(&self, item: &WorkItem, hash: &str, at: DateTime<Utc>) -> String {
        format!(
            "{}/{}/{}_{}_{}",
            self.quarantine_dir,
            item.data_type,
            item.logical_name(),
            at.format("%Y%m%dT%H%M%SZ"),
            short_hash(hash)
        )
    }
}

fn short_hash(hash: &str) -> &str {
    &hash[..hash.len().min(12)]
}

/// How `land` treats a logical name that already holds different content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LandMode {
    /// Fail with [`StoreError::Conflict`].
    New,
    /// Retire the old record and keep both for audit.
    Supersede,
}

/// Everything `land` records besides the bytes themselves.
#[derive(Debug, Clone)]
pub struct LandMetadata {
    pub item: WorkItem,
    pub retrieved_at: DateTime<Utc>,
    pub quality_score: f64,
    pub stats: Option<PayloadStats>,
}

impl LandMetadata {
    pub fn from_verdict(item: &WorkItem, verdict: &QualityVerdict) -> Self {
        Self {
            item: item.clone(),
            retrieved_at: Utc::now(),
            quality_score: verdict.quality_score(),
            stats: verdict.stats,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LandingKind {
    /// New bytes written at the canonical path.
    Written,
    /// Identical bytes already stored under another logical name; the
    /// record points at that object and nothing was written.
    Aliased,
    /// The logical name already holds these bytes.
    Unchanged,
    /// Replaced a record holding `previous_hash`.
    Superseded { previous_hash: String },
}

#[derive(Debug, Clone)]
pub struct Landing {
    pub record: FileRecord,
    pub kind: LandingKind,
}

/// A post-hoc verification finding.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "problem", rename_all = "snake_case")]
pub enum VerifyProblem {
    Missing,
    HashMismatch { actual: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerifyFinding {
    pub logical_name: String,
    pub path: String,
    #[serde(flatten)]
    pub problem: VerifyProblem,
}

/// Sidecar written next to a quarantined payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineNote {
    pub logical_name: String,
    pub data_type: String,
    pub period_key: PeriodKey,
    pub reason: QuarantineReason,
    pub content_hash: String,
    pub byte_size: u64,
    pub quarantined_at: DateTime<Utc>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub anomaly_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum LedgerEvent {
    Landed {
        record: FileRecord,
    },
    Superseded {
        logical_name: String,
        content_hash: String,
        by_hash: String,
        at: DateTime<Utc>,
    },
    Corrupt {
        logical_name: String,
        content_hash: String,
        at: DateTime<Utc>,
    },
    /// Payload object moved; records pointing at `from` follow it.
    Relocated {
        from: String,
        to: String,
    },
}

#[derive(Default)]
struct Ledger {
    records: Vec<FileRecord>,
    /// Hash to indices of records that are `Current`.
    hash_index: HashMap<String, Vec<usize>>,
    /// The ledger object ends mid-line and the next append must start a
    /// fresh one.
    needs_newline: bool,
}

impl Ledger {
    /// Latest non-superseded record for a logical name.
    fn live_index(&self, logical_name: &str) -> Option<usize> {
        self.records
            .iter()
            .rposition(|r| r.logical_name == logical_name && !matches!(r.status, RecordStatus::Superseded { .. }))
    }

    fn find_live(&self, logical_name: &str, hash: &str) -> Option<usize> {
        self.records.iter().rposition(|r| {
            r.logical_name == logical_name
                && r.content_hash == hash
                && !matches!(r.status, RecordStatus::Superseded { .. })
        })
    }

    fn unindex(&mut self, idx: usize) {
        let hash = self.records[idx].content_hash.clone();
        if let Some(list) = self.hash_index.get_mut(&hash) {
            list.retain(|&i| i != idx);
            if list.is_empty() {
                self.hash_index.remove(&hash);
            }
        }
    }

    fn apply(&mut self, event: LedgerEvent) {
        match event {
            LedgerEvent::Landed { record } => {
                let idx = self.records.len();
                if record.is_current() {
                    self.hash_index
                        .entry(record.content_hash.clone())
                        .or_default()
                        .push(idx);
                }
                self.records.push(record);
            }
            LedgerEvent::Superseded {
                logical_name,
                content_hash,
                by_hash,
                at,
            } => {
                if let Some(idx) = self.find_live(&logical_name, &content_hash) {
                    self.unindex(idx);
                    self.records[idx].status = RecordStatus::Superseded { by_hash, at };
                }
            }
            LedgerEvent::Corrupt {
                logical_name,
                content_hash,
                at,
            } => {
                if let Some(idx) = self.find_live(&logical_name, &content_hash) {
                    self.unindex(idx);
                    self.records[idx].status = RecordStatus::Corrupt { detected_at: at };
                }
            }
            LedgerEvent::Relocated { from, to } => {
                for record in self.records.iter_mut().filter(|r| r.path == from) {
                    record.path = to.clone();
                }
            }
        }
    }
}

/// Deduplicating, auditable store of landed payloads.
pub struct ContentStore {
    store: Arc<dyn ObjectStore>,
    layout: StoreLayout,
    encoding: String,
    ledger: Mutex<Ledger>,
}

impl ContentStore {
    /// Open the store, replaying the record ledger if one exists.
    ///
    /// A torn final line (crash mid-append) is dropped from the ledger;
    /// damage anywhere else is an error.
    pub async fn open(
        store: Arc<dyn ObjectStore>,
        layout: StoreLayout,
        encoding: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let path = layout.ledger_path();
        let mut ledger = Ledger::default();

        match store.read_bytes(&path).await {
            Ok(bytes) => {
                ledger.needs_newline = !bytes.is_empty() && !bytes.ends_with(b"\n");
                let mut lines: Vec<(usize, &[u8])> = Vec::new();
                let mut offset = 0;
                for line in bytes.split(|b| *b == b'\n') {
                    if !line.iter().all(u8::is_ascii_whitespace) {
                        lines.push((offset, line));
                    }
                    offset += line.len() + 1;
                }
                let last = lines.len().saturating_sub(1);
                let mut torn_at = None;
                for (i, (start, line)) in lines.into_iter().enumerate() {
                    match serde_json::from_slice::<LedgerEvent>(line) {
                        Ok(event) => ledger.apply(event),
                        Err(e) if i == last => {
                            warn!(path = %path, error = %e, "dropping torn final ledger line");
                            torn_at = Some(start);
                        }
                        Err(e) => return Err(StoreError::serde(path.clone(), e)),
                    }
                }
                if let Some(start) = torn_at {
                    store.write_bytes(&path, &bytes[..start]).await?;
                    ledger.needs_newline = false;
                }
                debug!(records = ledger.records.len(), "record ledger replayed");
            }
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        Ok(Self {
            store,
            layout,
            encoding: encoding.into(),
            ledger: Mutex::new(ledger),
        })
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    async fn append(&self, ledger: &mut Ledger, event: LedgerEvent) -> Result<(), StoreError> {
        let path = self.layout.ledger_path();
        let mut line = Vec::new();
        if ledger.needs_newline {
            line.push(b'\n');
        }
        serde_json::to_writer(&mut line, &event).map_err(|e| StoreError::serde(path.clone(), e))?;
        line.push(b'\n');
        self.store.append_bytes(&path, &line).await?;
        ledger.needs_newline = false;
        ledger.apply(event);
        Ok(())
    }

    /// Whether `(data_type, period_key)` already holds this exact content.
    pub async fn is_duplicate(&self, hash: &str, data_type: &str, period_key: PeriodKey) -> bool {
        let ledger = self.ledger.lock().await;
        ledger.hash_index.get(hash).map_or(false, |idxs| {
            idxs.iter().any(|&i| {
                let r = &ledger.records[i];
                r.data_type == data_type && r.period_key == period_key
            })
        })
    }

    /// Every record ever landed, superseded ones included.
    pub async fn records(&self) -> Vec<FileRecord> {
        self.ledger.lock().await.records.clone()
    }

    /// Records whose status is `Current`.
    pub async fn current_records(&self) -> Vec<FileRecord> {
        self.ledger
            .lock()
            .await
            .records
            .iter()
            .filter(|r| r.is_current())
            .cloned()
            .collect()
    }

    pub async fn current_record(&self, logical_name: &str) -> Option<FileRecord> {
        let ledger = self.ledger.lock().await;
        ledger
            .live_index(logical_name)
            .map(|i| ledger.records[i].clone())
            .filter(FileRecord::is_current)
    }

    /// `(data_type, period)` cells that hold a healthy landed file.
    pub async fn landed_keys(&self) -> BTreeSet<(String, PeriodKey)> {
        self.ledger
            .lock()
            .await
            .records
            .iter()
            .filter(|r| r.is_current())
            .map(|r| (r.data_type.clone(), r.period_key))
            .collect()
    }

    /// Number of distinct hashes held by current records.
    pub async fn distinct_hashes(&self) -> usize {
        self.ledger.lock().await.hash_index.len()
    }

    /// Stats of the most recent accepted payloads preceding `item` for the
    /// same data type and period kind, oldest first.
    pub async fn baseline(&self, item: &WorkItem, window: usize) -> HistoricalBaseline {
        let ledger = self.ledger.lock().await;
        let mut prior: Vec<(PeriodKey, PayloadStats)> = ledger
            .records
            .iter()
            .filter(|r| {
                r.is_current()
                    && r.data_type == item.data_type
                    && r.period_kind == item.period_kind
                    && r.period_key < item.period_key
            })
            .filter_map(|r| r.stats.map(|s| (r.period_key, s)))
            .collect();
        prior.sort_by_key(|(k, _)| *k);
        let start = prior.len().saturating_sub(window);
        HistoricalBaseline::new(prior[start..].iter().map(|(_, s)| *s).collect())
    }

    /// Write an accepted payload and its record.
    ///
    /// Bytes are stored unchanged. Landing identical content for the same
    /// logical name is a no-op; different content needs
    /// [`LandMode::Supersede`] unless the existing record was marked
    /// corrupt.
    #[instrument(skip_all, fields(logical = %meta.item.logical_name()))]
    pub async fn land(
        &self,
        payload: &[u8],
        meta: LandMetadata,
        mode: LandMode,
    ) -> Result<Landing, StoreError> {
        let hash = compute_hash(payload);
        let item = &meta.item;
        let logical = item.logical_name();
        let mut ledger = self.ledger.lock().await;

        let mut previous: Option<FileRecord> = None;
        if let Some(idx) = ledger.live_index(&logical) {
            let existing = &ledger.records[idx];
            if existing.is_current() && existing.content_hash == hash {
                return Ok(Landing {
                    record: existing.clone(),
                    kind: LandingKind::Unchanged,
                });
            }
            let corrupt = matches!(existing.status, RecordStatus::Corrupt { .. });
            if !corrupt && mode == LandMode::New {
                return Err(StoreError::Conflict {
                    logical_name: logical,
                    existing: existing.content_hash.clone(),
                    incoming: hash,
                });
            }
            previous = Some(existing.clone());
        }

        let at = meta.retrieved_at;
        let canonical = self.layout.payload_path(item);

        if let Some(old) = &previous {
            if old.path == canonical && self.store.exists(&canonical).await? {
                let archive = self.layout.archive_path(&logical, &old.content_hash, at);
                self.store.rename(&canonical, &archive).await?;
                self.append(
                    &mut ledger,
                    LedgerEvent::Relocated {
                        from: canonical.clone(),
                        to: archive.clone(),
                    },
                )
                .await?;
                // Aliases of the old bytes followed them; keep their sidecars in step.
                let followers: Vec<FileRecord> = ledger
                    .records
                    .iter()
                    .filter(|r| r.is_current() && r.path == archive && r.logical_name != logical)
                    .cloned()
                    .collect();
                for record in &followers {
                    let path = self.layout.record_meta_path(record);
                    let json = serde_json::to_vec_pretty(record)
                        .map_err(|e| StoreError::serde(path.clone(), e))?;
                    self.store.write_bytes(&path, &json).await?;
                }
            }
            self.append(
                &mut ledger,
                LedgerEvent::Superseded {
                    logical_name: logical.clone(),
                    content_hash: old.content_hash.clone(),
                    by_hash: hash.clone(),
                    at,
                },
            )
            .await?;
        }

        let shared_path = ledger
            .hash_index
            .get(&hash)
            .and_then(|idxs| idxs.first())
            .map(|&i| ledger.records[i].path.clone());

        let (path, mut kind) = match shared_path {
            Some(path) => (path, LandingKind::Aliased),
            None => {
                self.store.write_bytes(&canonical, payload).await?;
                (canonical, LandingKind::Written)
            }
        };
        if let Some(old) = &previous {
            kind = LandingKind::Superseded {
                previous_hash: old.content_hash.clone(),
            };
        }

        let record = FileRecord {
            logical_name: logical,
            data_type: item.data_type.clone(),
            period_kind: item.period_kind,
            period_key: item.period_key,
            retrieved_at: at,
            byte_size: payload.len() as u64,
            content_hash: hash,
            encoding: self.encoding.clone(),
            source: item.source.clone(),
            quality_score: meta.quality_score,
            stats: meta.stats,
            path,
            status: RecordStatus::Current,
        };

        let meta_path = self.layout.meta_path(item);
        let meta_json = serde_json::to_vec_pretty(&record)
            .map_err(|e| StoreError::serde(meta_path.clone(), e))?;
        self.store.write_bytes(&meta_path, &meta_json).await?;
        self.append(
            &mut ledger,
            LedgerEvent::Landed {
                record: record.clone(),
            },
        )
        .await?;

        info!(hash = %short_hash(&record.content_hash), kind = ?kind, "landed");
        Ok(Landing { record, kind })
    }

    /// Isolate a payload with its rejection reason. Never touches records
    /// or the hash index. Returns the payload's path.
    #[instrument(skip_all, fields(logical = %item.logical_name(), reason = reason.as_str()))]
    pub async fn quarantine(
        &self,
        payload: &[u8],
        item: &WorkItem,
        reason: QuarantineReason,
        verdict: &QualityVerdict,
    ) -> Result<String, StoreError> {
        let hash = compute_hash(payload);
        let now = Utc::now();
        let base = self.layout.quarantine_stem(item, &hash, now);
        let mut stem = base.clone();
        let mut n = 1;
        while self.store.exists(&format!("{}.csv", stem)).await? {
            stem = format!("{}_{}", base, n);
            n += 1;
        }
        let payload_path = format!("{}.csv", stem);
        let note_path = format!("{}.reason.json", stem);

        let note = QuarantineNote {
            logical_name: item.logical_name(),
            data_type: item.data_type.clone(),
            period_key: item.period_key,
            reason,
            content_hash: hash,
            byte_size: payload.len() as u64,
            quarantined_at: now,
            errors: verdict.errors.clone(),
            warnings: verdict.warnings.clone(),
            anomaly_score: verdict.anomaly_score,
        };
        let note_json =
            serde_json::to_vec_pretty(&note).map_err(|e| StoreError::serde(note_path.clone(), e))?;

        self.store.write_bytes(&payload_path, payload).await?;
        self.store.write_bytes(&note_path, &note_json).await?;
        warn!(path = %payload_path, "payload quarantined");
        Ok(payload_path)
    }

    /// Quarantine notes currently on disk.
    pub async fn quarantine_notes(&self) -> Result<Vec<QuarantineNote>, StoreError> {
        let prefix = format!("{}/", self.layout.quarantine_dir);
        let mut notes = Vec::new();
        for path in self.store.list(&prefix).await? {
            if !path.ends_with(".reason.json") {
                continue;
            }
            let bytes = self.store.read_bytes(&path).await?;
            match serde_json::from_slice::<QuarantineNote>(&bytes) {
                Ok(note) => notes.push(note),
                Err(e) => warn!(path = %path, error = %e, "unreadable quarantine note"),
            }
        }
        Ok(notes)
    }

    /// Flag the live record for `logical_name` as corrupt so the next run
    /// re-fetches it. Returns the flagged record.
    pub async fn mark_corrupt(&self, logical_name: &str) -> Result<Option<FileRecord>, StoreError> {
        let mut ledger = self.ledger.lock().await;
        let Some(idx) = ledger.live_index(logical_name) else {
            return Ok(None);
        };
        if !ledger.records[idx].is_current() {
            return Ok(Some(ledger.records[idx].clone()));
        }
        let content_hash = ledger.records[idx].content_hash.clone();
        self.append(
            &mut ledger,
            LedgerEvent::Corrupt {
                logical_name: logical_name.to_string(),
                content_hash,
                at: Utc::now(),
            },
        )
        .await?;
        warn!(logical = logical_name, "record marked corrupt");
        Ok(Some(ledger.records[idx].clone()))
    }

    /// Read the stored bytes behind a record.
    pub async fn read_payload(&self, record: &FileRecord) -> Result<Vec<u8>, StoreError> {
        self.store.read_bytes(&record.path).await
    }

    /// Re-hash every current record's bytes.
    pub async fn verify(&self) -> Result<Vec<VerifyFinding>, StoreError> {
        let mut findings = Vec::new();
        for record in self.current_records().await {
            match self.store.read_bytes(&record.path).await {
                Ok(bytes) => {
                    let actual = compute_hash(&bytes);
                    if actual != record.content_hash {
                        findings.push(VerifyFinding {
                            logical_name: record.logical_name,
                            path: record.path,
                            problem: VerifyProblem::HashMismatch { actual },
                        });
                    }
                }
                Err(StoreError::NotFound(_)) => findings.push(VerifyFinding {
                    logical_name: record.logical_name,
                    path: record.path,
                    problem: VerifyProblem::Missing,
                }),
                Err(e) => return Err(e),
            }
        }
        Ok(findings)
    }

    /// Write the derived hash index snapshot (`hash -> logical names`).
    pub async fn flush(&self) -> Result<(), StoreError> {
        let ledger = self.ledger.lock().await;
        let snapshot: BTreeMap<&str, Vec<&str>> = ledger
            .hash_index
            .iter()
            .map(|(hash, idxs)| {
                let names = idxs
                    .iter()
                    .map(|&i| ledger.records[i].logical_name.as_str())
                    .collect();
                (hash.as_str(), names)
            })
            .collect();
        let path = self.layout.index_path();
        let json = serde_json::to_vec_pretty(&snapshot).map_err(|e| StoreError::serde(path.clone(), e))?;
        self.store.write_bytes(&path, &json).await
    }
}
