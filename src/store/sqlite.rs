//! SQLite Store
//!
//! Persists markets, proposals, signatures, optimistic resolutions and votes.
//! Unique constraints back the duplicate-signature and duplicate-vote rules;
//! status-guarded `UPDATE`s back the compare-and-swap contract.

use anyhow::{Context, Result};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row, Transaction};
use std::{collections::BTreeSet, sync::Arc};
use tokio::sync::Mutex;

use super::{decode_ts, encode_ts, MarketEffect, Store};
use crate::models::{
    DisputeInfo, LockInfo, Market, MarketStatus, Outcome, ProposalStatus, ResolutionProposal,
    UmaResolution, UmaStatus, Vote,
};

const PROPOSAL_COLUMNS: &str = "id, market_id, proposed_outcome, proposer_admin_id, threshold, \
     status, evidence, resolution_hash, created_at, resolved_at, tx_id";

const UMA_COLUMNS: &str = "id, market_id, proposed_outcome, proposed_by, evidence, status, \
     proposed_at, dispute_window_ends, committee_size, disputed_by, dispute_reason, disputed_at, \
     voting_ends, final_outcome, lock_hash, locked_at, tx_id";

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open governance db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS markets (
            id TEXT PRIMARY KEY,
            question TEXT NOT NULL,
            status TEXT NOT NULL,
            outcome INTEGER,
            dispute_flag INTEGER NOT NULL DEFAULT 0,
            app_id INTEGER
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS resolution_proposals (
            id TEXT PRIMARY KEY,
            market_id TEXT NOT NULL,
            proposed_outcome INTEGER NOT NULL CHECK (proposed_outcome IN (0, 1)),
            proposer_admin_id TEXT NOT NULL,
            threshold INTEGER NOT NULL,
            status TEXT NOT NULL,
            evidence TEXT NOT NULL,
            resolution_hash TEXT NOT NULL,
            created_at TEXT NOT NULL,
            resolved_at TEXT,
            tx_id TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_resolution_proposals_market
         ON resolution_proposals(market_id, created_at)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS proposal_signatures (
            proposal_id TEXT NOT NULL,
            admin_id TEXT NOT NULL,
            PRIMARY KEY (proposal_id, admin_id),
            FOREIGN KEY (proposal_id) REFERENCES resolution_proposals(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS uma_resolutions (
            id TEXT PRIMARY KEY,
            market_id TEXT NOT NULL,
            proposed_outcome INTEGER NOT NULL CHECK (proposed_outcome IN (0, 1)),
            proposed_by TEXT NOT NULL,
            evidence TEXT NOT NULL,
            status TEXT NOT NULL,
            proposed_at TEXT NOT NULL,
            dispute_window_ends TEXT NOT NULL,
            committee_size INTEGER NOT NULL,
            disputed_by TEXT,
            dispute_reason TEXT,
            disputed_at TEXT,
            voting_ends TEXT,
            final_outcome INTEGER,
            lock_hash TEXT,
            locked_at TEXT,
            tx_id TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_uma_resolutions_market
         ON uma_resolutions(market_id, proposed_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_uma_resolutions_status ON uma_resolutions(status)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS uma_votes (
            id TEXT PRIMARY KEY,
            resolution_id TEXT NOT NULL,
            admin_id TEXT NOT NULL,
            vote INTEGER NOT NULL CHECK (vote IN (0, 1)),
            voted_at TEXT NOT NULL,
            UNIQUE (resolution_id, admin_id)
        )",
        [],
    )?;

    Ok(())
}

// ============================================================================
// Row decoding
// ============================================================================

fn conversion_error(
    idx: usize,
    ty: Type,
    e: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, e.into())
}

fn col_ts(row: &Row, idx: usize) -> rusqlite::Result<chrono::DateTime<chrono::Utc>> {
    let raw: String = row.get(idx)?;
    decode_ts(&raw).map_err(|e| conversion_error(idx, Type::Text, e))
}

fn col_opt_ts(row: &Row, idx: usize) -> rusqlite::Result<Option<chrono::DateTime<chrono::Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => decode_ts(&raw)
            .map(Some)
            .map_err(|e| conversion_error(idx, Type::Text, e)),
        None => Ok(None),
    }
}

fn col_outcome(row: &Row, idx: usize) -> rusqlite::Result<Outcome> {
    let raw: i64 = row.get(idx)?;
    Outcome::try_from(raw).map_err(|e| conversion_error(idx, Type::Integer, e))
}

fn col_opt_outcome(row: &Row, idx: usize) -> rusqlite::Result<Option<Outcome>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(raw) => Outcome::try_from(raw)
            .map(Some)
            .map_err(|e| conversion_error(idx, Type::Integer, e)),
        None => Ok(None),
    }
}

fn col_usize(row: &Row, idx: usize) -> rusqlite::Result<usize> {
    let raw: i64 = row.get(idx)?;
    usize::try_from(raw).map_err(|e| conversion_error(idx, Type::Integer, e))
}

fn market_from_row(row: &Row) -> rusqlite::Result<Market> {
    let status: String = row.get(2)?;
    let app_id: Option<i64> = row.get(5)?;
    Ok(Market {
        id: row.get(0)?,
        question: row.get(1)?,
        status: MarketStatus::from_str(&status)
            .ok_or_else(|| conversion_error(2, Type::Text, format!("unknown status {status}")))?,
        outcome: col_opt_outcome(row, 3)?,
        dispute_flag: row.get::<_, i64>(4)? != 0,
        app_id: app_id.map(|v| v as u64),
    })
}

/// Signatures are filled in separately.
fn proposal_from_row(row: &Row) -> rusqlite::Result<ResolutionProposal> {
    let status: String = row.get(5)?;
    Ok(ResolutionProposal {
        id: row.get(0)?,
        market_id: row.get(1)?,
        proposed_outcome: col_outcome(row, 2)?,
        proposer_admin_id: row.get(3)?,
        signatures: BTreeSet::new(),
        threshold: col_usize(row, 4)?,
        status: ProposalStatus::from_str(&status)
            .ok_or_else(|| conversion_error(5, Type::Text, format!("unknown status {status}")))?,
        evidence: row.get(6)?,
        resolution_hash: row.get(7)?,
        created_at: col_ts(row, 8)?,
        resolved_at: col_opt_ts(row, 9)?,
        tx_id: row.get(10)?,
    })
}

fn uma_from_row(row: &Row) -> rusqlite::Result<UmaResolution> {
    let status: String = row.get(5)?;

    let disputed_by: Option<String> = row.get(9)?;
    let dispute = match disputed_by {
        Some(disputed_by) => Some(DisputeInfo {
            disputed_by,
            reason: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
            disputed_at: col_ts(row, 11)?,
            voting_ends: col_ts(row, 12)?,
        }),
        None => None,
    };

    let lock = match col_opt_outcome(row, 13)? {
        Some(final_outcome) => Some(LockInfo {
            final_outcome,
            lock_hash: row.get::<_, Option<String>>(14)?.unwrap_or_default(),
            locked_at: col_ts(row, 15)?,
            tx_id: row.get(16)?,
        }),
        None => None,
    };

    Ok(UmaResolution {
        id: row.get(0)?,
        market_id: row.get(1)?,
        proposed_outcome: col_outcome(row, 2)?,
        proposed_by: row.get(3)?,
        evidence: row.get(4)?,
        status: UmaStatus::from_str(&status)
            .ok_or_else(|| conversion_error(5, Type::Text, format!("unknown status {status}")))?,
        proposed_at: col_ts(row, 6)?,
        dispute_window_ends: col_ts(row, 7)?,
        committee_size: col_usize(row, 8)?,
        dispute,
        lock,
    })
}

fn vote_from_row(row: &Row) -> rusqlite::Result<Vote> {
    Ok(Vote {
        id: row.get(0)?,
        resolution_id: row.get(1)?,
        admin_id: row.get(2)?,
        vote: col_outcome(row, 3)?,
        voted_at: col_ts(row, 4)?,
    })
}

fn load_signatures(conn: &Connection, proposal_id: &str) -> Result<BTreeSet<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT admin_id FROM proposal_signatures WHERE proposal_id = ?1",
    )?;
    let signatures = stmt
        .query_map(params![proposal_id], |row| row.get::<_, String>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(signatures)
}

fn query_proposals(
    conn: &Connection,
    filter_sql: &str,
    param: &str,
) -> Result<Vec<ResolutionProposal>> {
    let sql = format!(
        "SELECT {PROPOSAL_COLUMNS} FROM resolution_proposals WHERE {filter_sql} \
         ORDER BY created_at ASC, rowid ASC"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut proposals = stmt
        .query_map(params![param], proposal_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    for proposal in &mut proposals {
        proposal.signatures = load_signatures(conn, &proposal.id)?;
    }
    Ok(proposals)
}

fn query_uma(conn: &Connection, filter_sql: &str, param: &str) -> Result<Vec<UmaResolution>> {
    let sql = format!(
        "SELECT {UMA_COLUMNS} FROM uma_resolutions WHERE {filter_sql} \
         ORDER BY proposed_at ASC, rowid ASC"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let resolutions = stmt
        .query_map(params![param], uma_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(resolutions)
}

fn apply_effect(tx: &Transaction, market_id: &str, effect: Option<MarketEffect>) -> Result<()> {
    let rows = match effect {
        None => return Ok(()),
        Some(MarketEffect::FlagDisputed) => tx.execute(
            "UPDATE markets SET dispute_flag = 1 WHERE id = ?1",
            params![market_id],
        )?,
        Some(MarketEffect::Resolve(outcome)) => tx.execute(
            "UPDATE markets SET status = ?2, outcome = ?3 WHERE id = ?1",
            params![
                market_id,
                MarketStatus::Resolved.as_str(),
                outcome.as_u8() as i64
            ],
        )?,
    };
    if rows == 0 {
        anyhow::bail!("market {market_id} not found");
    }
    Ok(())
}

#[async_trait::async_trait]
impl Store for SqliteStore {
    async fn get_market(&self, market_id: &str) -> Result<Option<Market>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, question, status, outcome, dispute_flag, app_id
             FROM markets WHERE id = ?1",
        )?;
        let market = stmt
            .query_row(params![market_id], market_from_row)
            .optional()?;
        Ok(market)
    }

    async fn upsert_market(&self, market: &Market) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO markets (id, question, status, outcome, dispute_flag, app_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                question = excluded.question,
                status = excluded.status,
                outcome = excluded.outcome,
                dispute_flag = excluded.dispute_flag,
                app_id = excluded.app_id",
            params![
                &market.id,
                &market.question,
                market.status.as_str(),
                market.outcome.map(|o| o.as_u8() as i64),
                market.dispute_flag as i64,
                market.app_id.map(|v| v as i64),
            ],
        )
        .context("upsert market")?;
        Ok(())
    }

    async fn update_market_resolution(
        &self,
        market_id: &str,
        status: MarketStatus,
        outcome: Option<Outcome>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let rows = conn.execute(
            "UPDATE markets SET status = ?2, outcome = ?3 WHERE id = ?1",
            params![market_id, status.as_str(), outcome.map(|o| o.as_u8() as i64)],
        )?;
        if rows == 0 {
            anyhow::bail!("market {market_id} not found");
        }
        Ok(())
    }

    async fn insert_proposal(&self, proposal: &ResolutionProposal) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO resolution_proposals
             (id, market_id, proposed_outcome, proposer_admin_id, threshold, status, evidence,
              resolution_hash, created_at, resolved_at, tx_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                &proposal.id,
                &proposal.market_id,
                proposal.proposed_outcome.as_u8() as i64,
                &proposal.proposer_admin_id,
                proposal.threshold as i64,
                proposal.status.as_str(),
                &proposal.evidence,
                &proposal.resolution_hash,
                encode_ts(&proposal.created_at),
                proposal.resolved_at.as_ref().map(encode_ts),
                proposal.tx_id.as_deref(),
            ],
        )
        .context("insert proposal")?;
        for admin_id in &proposal.signatures {
            tx.execute(
                "INSERT OR IGNORE INTO proposal_signatures (proposal_id, admin_id) VALUES (?1, ?2)",
                params![&proposal.id, admin_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn get_proposal(&self, proposal_id: &str) -> Result<Option<ResolutionProposal>> {
        let conn = self.conn.lock().await;
        Ok(query_proposals(&conn, "id = ?1", proposal_id)?.into_iter().next())
    }

    async fn insert_signature(&self, proposal_id: &str, admin_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let rows = conn.execute(
            "INSERT OR IGNORE INTO proposal_signatures (proposal_id, admin_id) VALUES (?1, ?2)",
            params![proposal_id, admin_id],
        )?;
        Ok(rows == 1)
    }

    async fn update_proposal(
        &self,
        proposal: &ResolutionProposal,
        expected: ProposalStatus,
        effect: Option<MarketEffect>,
    ) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let rows = tx.execute(
            "UPDATE resolution_proposals
             SET status = ?2, resolved_at = ?3, tx_id = ?4
             WHERE id = ?1 AND status = ?5",
            params![
                &proposal.id,
                proposal.status.as_str(),
                proposal.resolved_at.as_ref().map(encode_ts),
                proposal.tx_id.as_deref(),
                expected.as_str(),
            ],
        )?;
        if rows == 0 {
            return Ok(false);
        }
        apply_effect(&tx, &proposal.market_id, effect)?;
        tx.commit()?;
        Ok(true)
    }

    async fn proposals_for_market(&self, market_id: &str) -> Result<Vec<ResolutionProposal>> {
        let conn = self.conn.lock().await;
        query_proposals(&conn, "market_id = ?1", market_id)
    }

    async fn proposals_by_status(
        &self,
        status: ProposalStatus,
    ) -> Result<Vec<ResolutionProposal>> {
        let conn = self.conn.lock().await;
        query_proposals(&conn, "status = ?1", status.as_str())
    }

    async fn insert_uma_resolution(&self, resolution: &UmaResolution) -> Result<()> {
        let conn = self.conn.lock().await;
        let dispute = resolution.dispute.as_ref();
        let lock = resolution.lock.as_ref();
        conn.execute(
            &format!(
                "INSERT INTO uma_resolutions ({UMA_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
            ),
            params![
                &resolution.id,
                &resolution.market_id,
                resolution.proposed_outcome.as_u8() as i64,
                &resolution.proposed_by,
                &resolution.evidence,
                resolution.status.as_str(),
                encode_ts(&resolution.proposed_at),
                encode_ts(&resolution.dispute_window_ends),
                resolution.committee_size as i64,
                dispute.map(|d| d.disputed_by.as_str()),
                dispute.map(|d| d.reason.as_str()),
                dispute.map(|d| encode_ts(&d.disputed_at)),
                dispute.map(|d| encode_ts(&d.voting_ends)),
                lock.map(|l| l.final_outcome.as_u8() as i64),
                lock.map(|l| l.lock_hash.as_str()),
                lock.map(|l| encode_ts(&l.locked_at)),
                lock.and_then(|l| l.tx_id.as_deref()),
            ],
        )
        .context("insert uma resolution")?;
        Ok(())
    }

    async fn get_uma_resolution(&self, resolution_id: &str) -> Result<Option<UmaResolution>> {
        let conn = self.conn.lock().await;
        Ok(query_uma(&conn, "id = ?1", resolution_id)?.into_iter().next())
    }

    async fn uma_resolutions_for_market(&self, market_id: &str) -> Result<Vec<UmaResolution>> {
        let conn = self.conn.lock().await;
        query_uma(&conn, "market_id = ?1", market_id)
    }

    async fn uma_resolutions_by_status(&self, status: UmaStatus) -> Result<Vec<UmaResolution>> {
        let conn = self.conn.lock().await;
        query_uma(&conn, "status = ?1", status.as_str())
    }

    async fn update_uma_resolution(
        &self,
        resolution: &UmaResolution,
        expected: UmaStatus,
        effect: Option<MarketEffect>,
    ) -> Result<bool> {
        if !expected.can_advance_to(resolution.status) {
            anyhow::bail!(
                "illegal transition {} -> {} for resolution {}",
                expected.as_str(),
                resolution.status.as_str(),
                resolution.id
            );
        }
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let dispute = resolution.dispute.as_ref();
        let lock = resolution.lock.as_ref();
        // COALESCE keeps already-written fields: nothing is ever un-set.
        let rows = tx.execute(
            "UPDATE uma_resolutions SET
                status = ?2,
                disputed_by = COALESCE(disputed_by, ?3),
                dispute_reason = COALESCE(dispute_reason, ?4),
                disputed_at = COALESCE(disputed_at, ?5),
                voting_ends = COALESCE(voting_ends, ?6),
                final_outcome = COALESCE(final_outcome, ?7),
                lock_hash = COALESCE(lock_hash, ?8),
                locked_at = COALESCE(locked_at, ?9),
                tx_id = COALESCE(tx_id, ?10)
             WHERE id = ?1 AND status = ?11",
            params![
                &resolution.id,
                resolution.status.as_str(),
                dispute.map(|d| d.disputed_by.as_str()),
                dispute.map(|d| d.reason.as_str()),
                dispute.map(|d| encode_ts(&d.disputed_at)),
                dispute.map(|d| encode_ts(&d.voting_ends)),
                lock.map(|l| l.final_outcome.as_u8() as i64),
                lock.map(|l| l.lock_hash.as_str()),
                lock.map(|l| encode_ts(&l.locked_at)),
                lock.and_then(|l| l.tx_id.as_deref()),
                expected.as_str(),
            ],
        )?;
        if rows == 0 {
            return Ok(false);
        }
        apply_effect(&tx, &resolution.market_id, effect)?;
        tx.commit()?;
        Ok(true)
    }

    async fn insert_vote(&self, vote: &Vote) -> Result<bool> {
        let conn = self.conn.lock().await;
        let rows = conn.execute(
            "INSERT OR IGNORE INTO uma_votes (id, resolution_id, admin_id, vote, voted_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                &vote.id,
                &vote.resolution_id,
                &vote.admin_id,
                vote.vote.as_u8() as i64,
                encode_ts(&vote.voted_at),
            ],
        )?;
        Ok(rows == 1)
    }

    async fn get_votes_by_resolution(&self, resolution_id: &str) -> Result<Vec<Vote>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, resolution_id, admin_id, vote, voted_at
             FROM uma_votes WHERE resolution_id = ?1
             ORDER BY voted_at ASC, rowid ASC",
        )?;
        let votes = stmt
            .query_map(params![resolution_id], vote_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(votes)
    }
}
