//! PostgreSQL swap store

use super::SwapStore;
use crate::chain::{Chain, EscrowRef};
use crate::config::DatabaseConfig;
use crate::coordination::swap::{Swap, SwapId, SwapState, SwapStats, Transition};
use crate::error::{RelayerError, RelayerResult};
use crate::secret::{Hashlock, Secret};

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};

const SWAP_COLUMNS: &str = r#"
    id, source_chain, dest_chain, initiator, beneficiary, amount, dest_amount,
    secret, hashlock, timelock_source, timelock_dest, state,
    source_escrow_ref, dest_escrow_ref, dest_confirmed, dest_completed,
    refund_requested, source_refund_tx, dest_refund_tx, last_error,
    created_at, updated_at
"#;

/// Swap store backed by PostgreSQL
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn new(config: &DatabaseConfig) -> RelayerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Create tables inline; the schema is small and additive
    pub async fn run_migrations(&self) -> RelayerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS swaps (
                id VARCHAR(36) PRIMARY KEY,
                source_chain VARCHAR(16) NOT NULL,
                dest_chain VARCHAR(16) NOT NULL,
                initiator TEXT NOT NULL,
                beneficiary TEXT NOT NULL,
                amount TEXT NOT NULL,
                dest_amount TEXT NOT NULL,
                secret VARCHAR(64),
                hashlock VARCHAR(66) NOT NULL,
                timelock_source TIMESTAMPTZ NOT NULL,
                timelock_dest TIMESTAMPTZ NOT NULL,
                state VARCHAR(20) NOT NULL,
                source_escrow_ref TEXT,
                dest_escrow_ref TEXT,
                dest_confirmed BOOLEAN NOT NULL DEFAULT FALSE,
                dest_completed BOOLEAN NOT NULL DEFAULT FALSE,
                refund_requested BOOLEAN NOT NULL DEFAULT FALSE,
                source_refund_tx TEXT,
                dest_refund_tx TEXT,
                last_error TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for statement in [
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_swaps_hashlock ON swaps (hashlock)",
            "CREATE INDEX IF NOT EXISTS idx_swaps_state ON swaps (state)",
            "CREATE INDEX IF NOT EXISTS idx_swaps_source_escrow ON swaps (source_chain, source_escrow_ref)",
            "CREATE INDEX IF NOT EXISTS idx_swaps_dest_escrow ON swaps (dest_chain, dest_escrow_ref)",
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS swap_transitions (
                id BIGSERIAL PRIMARY KEY,
                swap_id VARCHAR(36) NOT NULL REFERENCES swaps (id),
                from_state VARCHAR(20),
                to_state VARCHAR(20) NOT NULL,
                reason TEXT NOT NULL,
                at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transitions_swap
            ON swap_transitions (swap_id, id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chain_checkpoints (
                chain VARCHAR(16) PRIMARY KEY,
                block_number BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    async fn fetch_one_where(&self, clause: &str, binds: &[&str]) -> RelayerResult<Option<Swap>> {
        let sql = format!("SELECT {} FROM swaps WHERE {} LIMIT 1", SWAP_COLUMNS, clause);
        let mut query = sqlx::query(&sql);
        for value in binds {
            query = query.bind(*value);
        }
        query
            .fetch_optional(&self.pool)
            .await?
            .map(|row| swap_from_row(&row))
            .transpose()
    }
}

#[async_trait]
impl SwapStore for PgStore {
    async fn insert_swap(&self, swap: &Swap, transition: &Transition) -> RelayerResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO swaps ({}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)",
            SWAP_COLUMNS
        ))
        .bind(swap.id.as_str())
        .bind(swap.source_chain.as_str())
        .bind(swap.dest_chain.as_str())
        .bind(&swap.initiator)
        .bind(&swap.beneficiary)
        .bind(&swap.amount)
        .bind(&swap.dest_amount)
        .bind(swap.storable_secret().map(Secret::to_hex))
        .bind(swap.hashlock.to_string())
        .bind(swap.timelock_source)
        .bind(swap.timelock_dest)
        .bind(swap.state.as_str())
        .bind(swap.source_escrow_ref.as_ref().map(EscrowRef::as_str))
        .bind(swap.dest_escrow_ref.as_ref().map(EscrowRef::as_str))
        .bind(swap.dest_confirmed)
        .bind(swap.dest_completed)
        .bind(swap.refund_requested)
        .bind(&swap.source_refund_tx)
        .bind(&swap.dest_refund_tx)
        .bind(&swap.last_error)
        .bind(swap.created_at)
        .bind(swap.updated_at)
        .execute(&mut *tx)
        .await?;

        insert_transition(&mut tx, transition).await?;
        tx.commit().await?;

        debug!("Inserted swap {}", swap.id);
        Ok(())
    }

    async fn update_swap(&self, swap: &Swap, transition: Option<&Transition>) -> RelayerResult<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE swaps SET
                secret = $2,
                state = $3,
                source_escrow_ref = $4,
                dest_escrow_ref = $5,
                dest_confirmed = $6,
                dest_completed = $7,
                refund_requested = $8,
                source_refund_tx = $9,
                dest_refund_tx = $10,
                last_error = $11,
                updated_at = $12
            WHERE id = $1
            "#,
        )
        .bind(swap.id.as_str())
        .bind(swap.storable_secret().map(Secret::to_hex))
        .bind(swap.state.as_str())
        .bind(swap.source_escrow_ref.as_ref().map(EscrowRef::as_str))
        .bind(swap.dest_escrow_ref.as_ref().map(EscrowRef::as_str))
        .bind(swap.dest_confirmed)
        .bind(swap.dest_completed)
        .bind(swap.refund_requested)
        .bind(&swap.source_refund_tx)
        .bind(&swap.dest_refund_tx)
        .bind(&swap.last_error)
        .bind(swap.updated_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RelayerError::SwapNotFound(swap.id.to_string()));
        }

        if let Some(transition) = transition {
            insert_transition(&mut tx, transition).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_swap(&self, id: &SwapId) -> RelayerResult<Option<Swap>> {
        self.fetch_one_where("id = $1", &[id.as_str()]).await
    }

    async fn find_by_escrow(&self, chain: Chain, escrow: &EscrowRef) -> RelayerResult<Option<Swap>> {
        self.fetch_one_where(
            "(source_chain = $1 AND source_escrow_ref = $2) OR (dest_chain = $1 AND dest_escrow_ref = $2)",
            &[chain.as_str(), escrow.as_str()],
        )
        .await
    }

    async fn find_by_hashlock(&self, hashlock: &Hashlock) -> RelayerResult<Option<Swap>> {
        let hashlock = hashlock.to_string();
        self.fetch_one_where("hashlock = $1", &[hashlock.as_str()])
            .await
    }

    async fn list_active(&self) -> RelayerResult<Vec<Swap>> {
        let sql = format!(
            "SELECT {} FROM swaps WHERE state NOT IN ('completed', 'refunded', 'failed') ORDER BY created_at",
            SWAP_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(swap_from_row).collect()
    }

    async fn transitions(&self, id: &SwapId) -> RelayerResult<Vec<Transition>> {
        let rows = sqlx::query(
            r#"
            SELECT swap_id, from_state, to_state, reason, at
            FROM swap_transitions
            WHERE swap_id = $1
            ORDER BY id
            "#,
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> RelayerResult<Transition> {
                let from_state: Option<String> = row.get("from_state");
                let to_state: String = row.get("to_state");
                Ok(Transition {
                    swap_id: id.clone(),
                    from_state: from_state.map(|s| s.parse()).transpose()?,
                    to_state: to_state.parse()?,
                    reason: row.get("reason"),
                    at: row.get("at"),
                })
            })
            .collect()
    }

    async fn get_checkpoint(&self, chain: Chain) -> RelayerResult<Option<u64>> {
        let row = sqlx::query("SELECT block_number FROM chain_checkpoints WHERE chain = $1")
            .bind(chain.as_str())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<i64, _>("block_number") as u64))
    }

    async fn save_checkpoint(&self, chain: Chain, height: u64) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chain_checkpoints (chain, block_number, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (chain)
            DO UPDATE SET block_number = $2, updated_at = NOW()
            "#,
        )
        .bind(chain.as_str())
        .bind(height as i64)
        .execute(&self.pool)
        .await?;

        debug!("Saved checkpoint for {}: block {}", chain, height);
        Ok(())
    }

    async fn stats(&self) -> RelayerResult<SwapStats> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM swaps GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = SwapStats::default();
        for row in rows {
            let state: SwapState = row.get::<String, _>("state").parse()?;
            let n = row.get::<i64, _>("n") as u64;
            stats.total += n;
            stats.by_state.insert(state, n);
        }
        Ok(stats)
    }

    async fn health_check(&self) -> RelayerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

async fn insert_transition(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    transition: &Transition,
) -> RelayerResult<()> {
    sqlx::query(
        r#"
        INSERT INTO swap_transitions (swap_id, from_state, to_state, reason, at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(transition.swap_id.as_str())
    .bind(transition.from_state.map(|s| s.as_str()))
    .bind(transition.to_state.as_str())
    .bind(&transition.reason)
    .bind(transition.at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn swap_from_row(row: &PgRow) -> RelayerResult<Swap> {
    let parse_chain = |column: &str| -> RelayerResult<Chain> {
        row.get::<String, _>(column)
            .parse()
            .map_err(|_| RelayerError::Internal(format!("bad {} in swaps row", column)))
    };
    let id: String = row.get("id");
    let secret: Option<String> = row.get("secret");
    let hashlock: String = row.get("hashlock");
    let source_escrow_ref: Option<String> = row.get("source_escrow_ref");
    let dest_escrow_ref: Option<String> = row.get("dest_escrow_ref");

    Ok(Swap {
        id: id.parse()?,
        source_chain: parse_chain("source_chain")?,
        dest_chain: parse_chain("dest_chain")?,
        initiator: row.get("initiator"),
        beneficiary: row.get("beneficiary"),
        amount: row.get("amount"),
        dest_amount: row.get("dest_amount"),
        secret: secret.map(|s| s.parse()).transpose()?,
        hashlock: hashlock.parse()?,
        timelock_source: row.get("timelock_source"),
        timelock_dest: row.get("timelock_dest"),
        state: row.get::<String, _>("state").parse()?,
        source_escrow_ref: source_escrow_ref.map(EscrowRef::new),
        dest_escrow_ref: dest_escrow_ref.map(EscrowRef::new),
        dest_confirmed: row.get("dest_confirmed"),
        dest_completed: row.get("dest_completed"),
        refund_requested: row.get("refund_requested"),
        source_refund_tx: row.get("source_refund_tx"),
        dest_refund_tx: row.get("dest_refund_tx"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
