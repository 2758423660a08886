use chrono::Utc;
use log::debug;
use sqlx::{
    postgres::{PgPool, PgPoolOptions, PgRow},
    Postgres as Pg, Row, Transaction,
};
use uuid::Uuid;

use crate::{
    invoice::{CoinType, CryptoAddress, CryptoCache, Invoice, NewInvoice, XmrKeys},
    storage::{Storage, StorageError},
    subaddress,
};

/// `PostgreSQL` invoice store.
#[derive(Debug, Clone)]
pub struct Postgres {
    pool: PgPool,
}

impl Postgres {
    /// Connect to the database at `url` and prepare the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if a connection cannot be established or the schema
    /// cannot be created.
    pub async fn connect(url: &str) -> Result<Postgres, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(url)
            .await?;
        debug!("Connection to PostgreSQL database established");

        let store = Postgres { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        // Statements run one at a time; sqlx prepares each query.
        let statements = [
            "CREATE TABLE IF NOT EXISTS users (
                id UUID PRIMARY KEY
            )",
            "CREATE TABLE IF NOT EXISTS xmr_crypto_data (
                id UUID PRIMARY KEY,
                priv_view_key TEXT NOT NULL UNIQUE,
                pub_spend_key TEXT NOT NULL UNIQUE,
                last_major_index BIGINT NOT NULL DEFAULT 0,
                last_minor_index BIGINT NOT NULL DEFAULT 0
            )",
            "CREATE TABLE IF NOT EXISTS crypto_data (
                id UUID PRIMARY KEY,
                user_id UUID NOT NULL UNIQUE REFERENCES users (id),
                xmr_id UUID REFERENCES xmr_crypto_data (id)
            )",
            "CREATE TABLE IF NOT EXISTS crypto_addresses (
                address TEXT PRIMARY KEY,
                coin TEXT NOT NULL,
                user_id UUID NOT NULL REFERENCES users (id),
                is_occupied BOOLEAN NOT NULL DEFAULT FALSE,
                major_index BIGINT NOT NULL DEFAULT 0,
                minor_index BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
            "CREATE TABLE IF NOT EXISTS invoices (
                id UUID PRIMARY KEY,
                crypto_address TEXT NOT NULL,
                coin TEXT NOT NULL,
                required_amount DOUBLE PRECISION NOT NULL,
                actual_amount DOUBLE PRECISION,
                confirmations_required SMALLINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                confirmed_at TIMESTAMPTZ,
                status TEXT NOT NULL DEFAULT 'PENDING',
                expires_at TIMESTAMPTZ NOT NULL,
                tx_id TEXT,
                user_id UUID NOT NULL REFERENCES users (id)
            )",
            "CREATE TABLE IF NOT EXISTS crypto_cache (
                coin TEXT PRIMARY KEY,
                last_synced_block_height BIGINT,
                synced_timestamp TIMESTAMPTZ
            )",
        ];
        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn claim_oldest_free_address(
        tx: &mut Transaction<'_, Pg>,
        user_id: Uuid,
        coin: CoinType,
    ) -> Result<Option<String>, StorageError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT address FROM crypto_addresses
             WHERE user_id = $1 AND coin = $2 AND is_occupied = FALSE
             ORDER BY created_at
             LIMIT 1
             FOR UPDATE",
        )
        .bind(user_id)
        .bind(coin.to_string())
        .fetch_optional(&mut **tx)
        .await?;

        let Some((address,)) = row else {
            return Ok(None);
        };
        sqlx::query("UPDATE crypto_addresses SET is_occupied = TRUE WHERE address = $1")
            .bind(&address)
            .execute(&mut **tx)
            .await?;
        Ok(Some(address))
    }

    async fn derive_fresh_address(
        tx: &mut Transaction<'_, Pg>,
        user_id: Uuid,
        network: monero::Network,
    ) -> Result<String, StorageError> {
        let (xmr_id,): (Option<Uuid>,) =
            sqlx::query_as("SELECT xmr_id FROM crypto_data WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(&mut **tx)
                .await?;
        let xmr_id = xmr_id.ok_or(StorageError::NotFound)?;

        // The row lock serializes allocation per user; different users
        // proceed independently.
        let (priv_view_key, pub_spend_key, last_major, last_minor): (String, String, i64, i64) =
            sqlx::query_as(
                "SELECT priv_view_key, pub_spend_key, last_major_index, last_minor_index
                 FROM xmr_crypto_data WHERE id = $1
                 FOR UPDATE",
            )
            .bind(xmr_id)
            .fetch_one(&mut **tx)
            .await?;

        let (major, minor) = subaddress::next_index(
            u32::try_from(last_major).unwrap_or(0),
            u32::try_from(last_minor).unwrap_or(0),
        );
        let keys = XmrKeys {
            priv_view_key,
            pub_spend_key,
        };
        let address = subaddress::derive(&keys, major, minor, network)?;

        sqlx::query(
            "INSERT INTO crypto_addresses
                 (address, coin, user_id, is_occupied, major_index, minor_index)
             VALUES ($1, $2, $3, TRUE, $4, $5)",
        )
        .bind(&address)
        .bind(CoinType::Xmr.to_string())
        .bind(user_id)
        .bind(i64::from(major))
        .bind(i64::from(minor))
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            "UPDATE xmr_crypto_data SET last_major_index = $2, last_minor_index = $3 WHERE id = $1",
        )
        .bind(xmr_id)
        .bind(i64::from(major))
        .bind(i64::from(minor))
        .execute(&mut **tx)
        .await?;

        Ok(address)
    }
}

impl Storage for Postgres {
    async fn create_user(&self, user_id: Option<Uuid>) -> Result<Uuid, StorageError> {
        let id = user_id.unwrap_or_else(Uuid::new_v4);
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO users (id) VALUES ($1)")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_unique_violation(e, "user"))?;
        sqlx::query("INSERT INTO crypto_data (id, user_id) VALUES ($1, $2)")
            .bind(Uuid::new_v4())
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(id)
    }

    async fn user_exists(&self, user_id: Uuid) -> Result<bool, StorageError> {
        let (exists,): (bool,) = sqlx::query_as("SELECT EXISTS (SELECT 1 FROM users WHERE id = $1)")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn update_xmr_keys(&self, user_id: Uuid, keys: XmrKeys) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        let (crypto_data_id, xmr_id): (Uuid, Option<Uuid>) =
            sqlx::query_as("SELECT id, xmr_id FROM crypto_data WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(&mut *tx)
                .await?;

        // Addresses derived from the replaced keys are unusable.
        sqlx::query("DELETE FROM crypto_addresses WHERE user_id = $1 AND coin = $2")
            .bind(user_id)
            .bind(CoinType::Xmr.to_string())
            .execute(&mut *tx)
            .await?;

        if let Some(xmr_id) = xmr_id {
            sqlx::query(
                "UPDATE xmr_crypto_data SET priv_view_key = $2, pub_spend_key = $3,
                     last_major_index = 0, last_minor_index = 0
                 WHERE id = $1",
            )
            .bind(xmr_id)
            .bind(&keys.priv_view_key)
            .bind(&keys.pub_spend_key)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_unique_violation(e, "XMR keys"))?;
        } else {
            let xmr_id = Uuid::new_v4();
            sqlx::query(
                "INSERT INTO xmr_crypto_data (id, priv_view_key, pub_spend_key) VALUES ($1, $2, $3)",
            )
            .bind(xmr_id)
            .bind(&keys.priv_view_key)
            .bind(&keys.pub_spend_key)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_unique_violation(e, "XMR keys"))?;
            sqlx::query("UPDATE crypto_data SET xmr_id = $2 WHERE id = $1")
                .bind(crypto_data_id)
                .bind(xmr_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn find_xmr_keys(&self, user_id: Uuid) -> Result<XmrKeys, StorageError> {
        let (priv_view_key, pub_spend_key): (String, String) = sqlx::query_as(
            "SELECT x.priv_view_key, x.pub_spend_key
             FROM crypto_data c
             JOIN xmr_crypto_data x ON x.id = c.xmr_id
             WHERE c.user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(XmrKeys {
            priv_view_key,
            pub_spend_key,
        })
    }

    async fn create_invoice(
        &self,
        invoice: NewInvoice,
        network: monero::Network,
    ) -> Result<Invoice, StorageError> {
        let mut tx = self.pool.begin().await?;

        let address =
            match Self::claim_oldest_free_address(&mut tx, invoice.user_id, invoice.coin).await? {
                Some(address) => address,
                None => Self::derive_fresh_address(&mut tx, invoice.user_id, network).await?,
            };

        let row = sqlx::query(
            "INSERT INTO invoices
                 (id, crypto_address, coin, required_amount, confirmations_required,
                  created_at, status, expires_at, user_id)
             VALUES ($1, $2, $3, $4, $5, now(), 'PENDING', $6, $7)
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&address)
        .bind(invoice.coin.to_string())
        .bind(invoice.required_amount)
        .bind(invoice.confirmations_required)
        .bind(invoice.expires_at)
        .bind(invoice.user_id)
        .fetch_one(&mut *tx)
        .await?;
        let invoice = row_to_invoice(&row)?;

        tx.commit().await?;
        Ok(invoice)
    }

    async fn find_invoices_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Invoice>, StorageError> {
        let rows = sqlx::query("SELECT * FROM invoices WHERE id = ANY ($1) ORDER BY created_at")
            .bind(ids.to_vec())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_invoice).collect()
    }

    async fn find_address(&self, address: &str) -> Result<CryptoAddress, StorageError> {
        let row = sqlx::query(
            "SELECT address, coin, user_id, is_occupied, major_index, minor_index
             FROM crypto_addresses WHERE address = $1",
        )
        .bind(address)
        .fetch_one(&self.pool)
        .await?;
        row_to_address(&row)
    }

    async fn confirm_mempool(
        &self,
        id: Uuid,
        actual_amount: f64,
        tx_id: &str,
    ) -> Result<Invoice, StorageError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE invoices SET status = 'PENDING_MEMPOOL', actual_amount = $2, tx_id = $3
             WHERE id = $1 AND status = 'PENDING'
             RETURNING *",
        )
        .bind(id)
        .bind(actual_amount)
        .bind(tx_id)
        .fetch_optional(&mut *tx)
        .await?;

        let invoice = match updated {
            Some(row) => row_to_invoice(&row)?,
            // Already past PENDING; return the row as it stands.
            None => {
                let row = sqlx::query("SELECT * FROM invoices WHERE id = $1")
                    .bind(id)
                    .fetch_one(&mut *tx)
                    .await?;
                row_to_invoice(&row)?
            }
        };

        tx.commit().await?;
        Ok(invoice)
    }

    async fn confirm(&self, id: Uuid) -> Result<Invoice, StorageError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "UPDATE invoices SET status = 'CONFIRMED', confirmed_at = now()
             WHERE id = $1
             RETURNING *",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        let invoice = row_to_invoice(&row)?;
        tx.commit().await?;
        Ok(invoice)
    }

    async fn expire(&self, id: Uuid) -> Result<Invoice, StorageError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("UPDATE invoices SET status = 'EXPIRED' WHERE id = $1 RETURNING *")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        let invoice = row_to_invoice(&row)?;
        tx.commit().await?;
        Ok(invoice)
    }

    async fn release_address(&self, address: &str) -> Result<(), StorageError> {
        sqlx::query("UPDATE crypto_addresses SET is_occupied = FALSE WHERE address = $1")
            .bind(address)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn shift_expiry_for_non_confirmed(&self) -> Result<Vec<Invoice>, StorageError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "UPDATE invoices SET expires_at = now() + interval '5 minutes'
             WHERE status IN ('PENDING', 'PENDING_MEMPOOL')
             RETURNING *",
        )
        .fetch_all(&mut *tx)
        .await?;
        let invoices = rows.iter().map(row_to_invoice).collect();
        tx.commit().await?;
        invoices
    }

    async fn update_cache(&self, coin: CoinType, height: u64) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO crypto_cache (coin, last_synced_block_height, synced_timestamp)
             VALUES ($1, $2, now())
             ON CONFLICT (coin)
             DO UPDATE SET last_synced_block_height = $2, synced_timestamp = now()",
        )
        .bind(coin.to_string())
        .bind(i64::try_from(height).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_cache(&self, coin: CoinType) -> Result<Option<CryptoCache>, StorageError> {
        let row: Option<(Option<i64>, Option<chrono::DateTime<Utc>>)> = sqlx::query_as(
            "SELECT last_synced_block_height, synced_timestamp FROM crypto_cache WHERE coin = $1",
        )
        .bind(coin.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(height, synced_at)| CryptoCache {
            coin,
            last_synced_block_height: height.and_then(|h| u64::try_from(h).ok()),
            synced_at,
        }))
    }
}

fn row_to_invoice(row: &PgRow) -> Result<Invoice, StorageError> {
    Ok(Invoice {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        coin: parse_enum(row.try_get("coin")?)?,
        crypto_address: row.try_get("crypto_address")?,
        required_amount: row.try_get("required_amount")?,
        actual_amount: row.try_get("actual_amount")?,
        confirmations_required: row.try_get("confirmations_required")?,
        tx_id: row.try_get("tx_id")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        confirmed_at: row.try_get("confirmed_at")?,
        status: parse_enum(row.try_get("status")?)?,
    })
}

fn row_to_address(row: &PgRow) -> Result<CryptoAddress, StorageError> {
    let major: i64 = row.try_get("major_index")?;
    let minor: i64 = row.try_get("minor_index")?;
    Ok(CryptoAddress {
        address: row.try_get("address")?,
        coin: parse_enum(row.try_get("coin")?)?,
        user_id: row.try_get("user_id")?,
        is_occupied: row.try_get("is_occupied")?,
        major_index: u32::try_from(major).unwrap_or(0),
        minor_index: u32::try_from(minor).unwrap_or(0),
    })
}

fn parse_enum<T: std::str::FromStr>(value: String) -> Result<T, StorageError>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .map_err(|e: T::Err| StorageError::Internal(Box::new(e)))
}

fn map_unique_violation(e: sqlx::Error, what: &str) -> StorageError {
    if let sqlx::Error::Database(db_err) = &e {
        // 23505: unique_violation.
        if db_err.code().as_deref() == Some("23505") {
            return StorageError::AlreadyExists(what.to_string());
        }
    }
    e.into()
}
