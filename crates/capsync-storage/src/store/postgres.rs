use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use capsync_core::{
    CoinDirectoryFields, CoinId, CoinMetadataUpdate, CoinQuoteUpdate, CoinRow, CoinStub,
    ContractAddressId, EntityCounts, LinkReport, MetadataPlan, MetadataRelations, PlatformId,
    TagId, TagKey, UrlId, UrlKey,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::QueryScalar;
use sqlx::{PgConnection, PgPool, Postgres, Row};

use super::{EntityStore, StoreError, StoreResult};

type IdQuery<'q> = QueryScalar<'q, Postgres, i64, PgArguments>;

/// PostgreSQL-backed store. Natural keys are `UNIQUE` constraints; creation is
/// `INSERT .. ON CONFLICT DO NOTHING RETURNING id` followed by a lookup when the
/// insert was a no-op.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("applying schema migrations")?;
        Ok(())
    }
}

fn db_error(err: sqlx::Error) -> StoreError {
    let contention = match &err {
        // serialization_failure, deadlock_detected, lock_not_available
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("40001" | "40P01" | "55P03")),
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        _ => false,
    };
    if contention {
        StoreError::Contention(err.to_string())
    } else {
        StoreError::Database(err.to_string())
    }
}

async fn insert_or_fetch(
    conn: &mut PgConnection,
    entity: &'static str,
    insert: IdQuery<'_>,
    lookup: IdQuery<'_>,
) -> StoreResult<i64> {
    if let Some(id) = insert.fetch_optional(&mut *conn).await.map_err(db_error)? {
        return Ok(id);
    }
    lookup
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error)?
        .ok_or(StoreError::Conflict { entity })
}

async fn ensure_coin_stub(conn: &mut PgConnection, stub: &CoinStub) -> StoreResult<CoinId> {
    let insert = sqlx::query_scalar::<Postgres, i64>(
        r#"
        INSERT INTO coin (cap_id, name, symbol, slug)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (cap_id) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(stub.cap_id)
    .bind(&stub.name)
    .bind(&stub.symbol)
    .bind(&stub.slug);
    let lookup = sqlx::query_scalar::<Postgres, i64>("SELECT id FROM coin WHERE cap_id = $1").bind(stub.cap_id);

    insert_or_fetch(conn, "coin", insert, lookup).await.map(CoinId)
}

async fn upsert_coin_directory(
    conn: &mut PgConnection,
    fields: &CoinDirectoryFields,
) -> StoreResult<CoinId> {
    sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO coin (cap_id, name, symbol, slug, rank, is_active,
                          first_historical_date, last_historical_date)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (cap_id) DO UPDATE
           SET name = EXCLUDED.name,
               symbol = EXCLUDED.symbol,
               slug = EXCLUDED.slug,
               rank = EXCLUDED.rank,
               is_active = EXCLUDED.is_active,
               first_historical_date = EXCLUDED.first_historical_date,
               last_historical_date = EXCLUDED.last_historical_date,
               updated_at = NOW()
        RETURNING id
        "#,
    )
    .bind(fields.cap_id)
    .bind(&fields.name)
    .bind(&fields.symbol)
    .bind(&fields.slug)
    .bind(fields.rank)
    .bind(fields.is_active)
    .bind(fields.first_historical_date)
    .bind(fields.last_historical_date)
    .fetch_one(&mut *conn)
    .await
    .map(CoinId)
    .map_err(db_error)
}

async fn update_coin_metadata(
    conn: &mut PgConnection,
    cap_id: i64,
    update: &CoinMetadataUpdate,
) -> StoreResult<CoinId> {
    sqlx::query_scalar::<_, i64>(
        r#"
        UPDATE coin
           SET category = $2,
               description = $3,
               logo = COALESCE($4, logo),
               logo_url = $5,
               subreddit = $6,
               notice = $7,
               platform = $8,
               twitter_username = $9,
               is_hidden = $10,
               date_launched = $11,
               self_reported_circulating_supply = $12,
               self_reported_tags = $13,
               self_reported_market_cap = $14,
               infinite_supply = $15,
               metadata_synced_at = NOW(),
               updated_at = NOW()
         WHERE cap_id = $1
        RETURNING id
        "#,
    )
    .bind(cap_id)
    .bind(&update.category)
    .bind(&update.description)
    .bind(&update.logo)
    .bind(&update.logo_url)
    .bind(&update.subreddit)
    .bind(&update.notice)
    .bind(&update.platform)
    .bind(&update.twitter_username)
    .bind(update.is_hidden)
    .bind(update.date_launched)
    .bind(update.self_reported_circulating_supply)
    .bind(&update.self_reported_tags)
    .bind(update.self_reported_market_cap)
    .bind(update.infinite_supply)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error)?
    .map(CoinId)
    .ok_or_else(|| StoreError::coin_not_found(cap_id))
}

async fn update_coin_quote(
    conn: &mut PgConnection,
    cap_id: i64,
    quote: &CoinQuoteUpdate,
) -> StoreResult<CoinId> {
    sqlx::query_scalar::<_, i64>(
        r#"
        UPDATE coin
           SET price = $2,
               volume_24h = $3,
               market_cap = $4,
               market_cap_dominance = $5,
               max_supply = $6,
               circulating_supply = $7,
               total_supply = $8,
               num_market_pairs = $9,
               quote_synced_at = NOW(),
               updated_at = NOW()
         WHERE cap_id = $1
        RETURNING id
        "#,
    )
    .bind(cap_id)
    .bind(quote.price)
    .bind(quote.volume_24h)
    .bind(quote.market_cap)
    .bind(quote.market_cap_dominance)
    .bind(quote.max_supply)
    .bind(quote.circulating_supply)
    .bind(quote.total_supply)
    .bind(quote.num_market_pairs)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error)?
    .map(CoinId)
    .ok_or_else(|| StoreError::coin_not_found(cap_id))
}

async fn upsert_platform(conn: &mut PgConnection, name: &str, coin: CoinId) -> StoreResult<PlatformId> {
    let insert = sqlx::query_scalar::<Postgres, i64>(
        "INSERT INTO platform (name, coin_id) VALUES ($1, $2) ON CONFLICT (name, coin_id) DO NOTHING RETURNING id",
    )
    .bind(name)
    .bind(coin.0);
    let lookup = sqlx::query_scalar::<Postgres, i64>("SELECT id FROM platform WHERE name = $1 AND coin_id = $2")
        .bind(name)
        .bind(coin.0);

    insert_or_fetch(conn, "platform", insert, lookup)
        .await
        .map(PlatformId)
}

async fn upsert_contract_address(
    conn: &mut PgConnection,
    address: &str,
    platform: PlatformId,
) -> StoreResult<ContractAddressId> {
    let insert = sqlx::query_scalar::<Postgres, i64>(
        "INSERT INTO contract_address (address, platform_id) VALUES ($1, $2) ON CONFLICT (address, platform_id) DO NOTHING RETURNING id",
    )
    .bind(address)
    .bind(platform.0);
    let lookup = sqlx::query_scalar::<Postgres, i64>(
        "SELECT id FROM contract_address WHERE address = $1 AND platform_id = $2",
    )
    .bind(address)
    .bind(platform.0);

    insert_or_fetch(conn, "contract_address", insert, lookup)
        .await
        .map(ContractAddressId)
}

async fn upsert_tag(conn: &mut PgConnection, tag: &TagKey) -> StoreResult<TagId> {
    let insert = sqlx::query_scalar::<Postgres, i64>(
        "INSERT INTO tag (name, category) VALUES ($1, $2) ON CONFLICT (name, category) DO NOTHING RETURNING id",
    )
    .bind(&tag.name)
    .bind(&tag.category);
    let lookup = sqlx::query_scalar::<Postgres, i64>("SELECT id FROM tag WHERE name = $1 AND category = $2")
        .bind(&tag.name)
        .bind(&tag.category);

    insert_or_fetch(conn, "tag", insert, lookup).await.map(TagId)
}

async fn upsert_url(conn: &mut PgConnection, coin: CoinId, url: &UrlKey) -> StoreResult<UrlId> {
    let insert = sqlx::query_scalar::<Postgres, i64>(
        "INSERT INTO url (coin_id, name, url) VALUES ($1, $2, $3) ON CONFLICT (coin_id, name, url) DO NOTHING RETURNING id",
    )
    .bind(coin.0)
    .bind(&url.name)
    .bind(&url.url);
    let lookup = sqlx::query_scalar::<Postgres, i64>("SELECT id FROM url WHERE coin_id = $1 AND name = $2 AND url = $3")
        .bind(coin.0)
        .bind(&url.name)
        .bind(&url.url);

    insert_or_fetch(conn, "url", insert, lookup).await.map(UrlId)
}

async fn link_rows(
    conn: &mut PgConnection,
    table: &str,
    column: &str,
    coin: CoinId,
    others: &[i64],
    report: &mut LinkReport,
) -> StoreResult<()> {
    let sql = format!(
        "INSERT INTO {table} (coin_id, {column}) VALUES ($1, $2) ON CONFLICT (coin_id, {column}) DO NOTHING"
    );
    for other in others {
        let done = sqlx::query(&sql)
            .bind(coin.0)
            .bind(*other)
            .execute(&mut *conn)
            .await
            .map_err(db_error)?;
        if done.rows_affected() > 0 {
            report.inserted += 1;
        } else {
            report.existing += 1;
        }
    }
    Ok(())
}

fn coin_from_row(row: &PgRow) -> Result<CoinRow, sqlx::Error> {
    let metadata_synced_at: Option<DateTime<Utc>> = row.try_get("metadata_synced_at")?;
    let quote_synced_at: Option<DateTime<Utc>> = row.try_get("quote_synced_at")?;

    let metadata = match metadata_synced_at {
        None => None,
        Some(_) => Some(CoinMetadataUpdate {
            category: row.try_get("category")?,
            description: row.try_get("description")?,
            logo: row.try_get("logo")?,
            logo_url: row.try_get("logo_url")?,
            subreddit: row.try_get("subreddit")?,
            notice: row.try_get("notice")?,
            platform: row.try_get("platform")?,
            twitter_username: row.try_get("twitter_username")?,
            is_hidden: row.try_get::<Option<bool>, _>("is_hidden")?.unwrap_or(false),
            date_launched: row.try_get("date_launched")?,
            self_reported_circulating_supply: row
                .try_get::<Option<bool>, _>("self_reported_circulating_supply")?
                .unwrap_or(false),
            self_reported_tags: row.try_get("self_reported_tags")?,
            self_reported_market_cap: row.try_get("self_reported_market_cap")?,
            infinite_supply: row
                .try_get::<Option<bool>, _>("infinite_supply")?
                .unwrap_or(false),
        }),
    };

    let quote = match quote_synced_at {
        None => None,
        Some(_) => Some(CoinQuoteUpdate {
            price: row.try_get("price")?,
            volume_24h: row.try_get("volume_24h")?,
            market_cap: row.try_get("market_cap")?,
            market_cap_dominance: row.try_get("market_cap_dominance")?,
            max_supply: row.try_get("max_supply")?,
            circulating_supply: row.try_get("circulating_supply")?,
            total_supply: row.try_get("total_supply")?,
            num_market_pairs: row.try_get("num_market_pairs")?,
        }),
    };

    Ok(CoinRow {
        id: CoinId(row.try_get("id")?),
        cap_id: row.try_get("cap_id")?,
        name: row.try_get("name")?,
        symbol: row.try_get("symbol")?,
        slug: row.try_get("slug")?,
        rank: row.try_get("rank")?,
        is_active: row.try_get("is_active")?,
        first_historical_date: row.try_get("first_historical_date")?,
        last_historical_date: row.try_get("last_historical_date")?,
        metadata,
        quote,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl EntityStore for PgStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn ensure_coin_stub(&self, stub: &CoinStub) -> StoreResult<CoinId> {
        let mut conn = self.pool.acquire().await.map_err(db_error)?;
        ensure_coin_stub(&mut conn, stub).await
    }

    async fn upsert_coin_directory(&self, fields: &CoinDirectoryFields) -> StoreResult<CoinId> {
        let mut conn = self.pool.acquire().await.map_err(db_error)?;
        upsert_coin_directory(&mut conn, fields).await
    }

    async fn apply_metadata(&self, plan: &MetadataPlan) -> StoreResult<MetadataRelations> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let coin = sqlx::query_scalar::<_, i64>("SELECT id FROM coin WHERE cap_id = $1")
            .bind(plan.cap_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_error)?
            .map(CoinId)
            .ok_or_else(|| StoreError::coin_not_found(plan.cap_id))?;

        let mut contract_addresses = Vec::with_capacity(plan.contracts.len());
        for contract in &plan.contracts {
            let owner = ensure_coin_stub(&mut tx, &contract.platform_coin).await?;
            let platform = upsert_platform(&mut tx, &contract.platform, owner).await?;
            contract_addresses.push(upsert_contract_address(&mut tx, &contract.address, platform).await?);
        }

        let mut tags = Vec::with_capacity(plan.tags.len());
        for tag in &plan.tags {
            tags.push(upsert_tag(&mut tx, tag).await?);
        }

        let mut urls = Vec::with_capacity(plan.urls.len());
        for url in &plan.urls {
            urls.push(upsert_url(&mut tx, coin, url).await?);
        }

        update_coin_metadata(&mut tx, plan.cap_id, &plan.update).await?;
        tx.commit().await.map_err(db_error)?;

        Ok(MetadataRelations {
            cap_id: plan.cap_id,
            coin,
            tags,
            urls,
            contract_addresses,
        })
    }

    async fn link_relations(&self, relations: &MetadataRelations) -> StoreResult<LinkReport> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let mut report = LinkReport::default();

        let tags: Vec<i64> = relations.tags.iter().map(|id| id.0).collect();
        let urls: Vec<i64> = relations.urls.iter().map(|id| id.0).collect();
        let contracts: Vec<i64> = relations.contract_addresses.iter().map(|id| id.0).collect();

        link_rows(&mut tx, "coin_tag", "tag_id", relations.coin, &tags, &mut report).await?;
        link_rows(&mut tx, "coin_url", "url_id", relations.coin, &urls, &mut report).await?;
        link_rows(
            &mut tx,
            "coin_contract_address",
            "contract_address_id",
            relations.coin,
            &contracts,
            &mut report,
        )
        .await?;

        tx.commit().await.map_err(db_error)?;
        Ok(report)
    }

    async fn apply_quote(&self, stub: &CoinStub, quote: &CoinQuoteUpdate) -> StoreResult<CoinId> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        ensure_coin_stub(&mut tx, stub).await?;
        let id = update_coin_quote(&mut tx, stub.cap_id, quote).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(id)
    }

    async fn coin_keys(&self) -> StoreResult<Vec<i64>> {
        sqlx::query_scalar::<_, i64>("SELECT cap_id FROM coin ORDER BY cap_id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)
    }

    async fn coin(&self, cap_id: i64) -> StoreResult<Option<CoinRow>> {
        let row = sqlx::query("SELECT * FROM coin WHERE cap_id = $1")
            .bind(cap_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        row.as_ref()
            .map(coin_from_row)
            .transpose()
            .map_err(db_error)
    }

    async fn counts(&self) -> StoreResult<EntityCounts> {
        let row = sqlx::query(
            r#"
            SELECT (SELECT COUNT(*) FROM coin) AS coins,
                   (SELECT COUNT(*) FROM platform) AS platforms,
                   (SELECT COUNT(*) FROM contract_address) AS contract_addresses,
                   (SELECT COUNT(*) FROM tag) AS tags,
                   (SELECT COUNT(*) FROM url) AS urls,
                   (SELECT COUNT(*) FROM coin_tag) AS coin_tags,
                   (SELECT COUNT(*) FROM coin_url) AS coin_urls,
                   (SELECT COUNT(*) FROM coin_contract_address) AS coin_contract_addresses
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        let count = |column: &str| -> StoreResult<u64> {
            row.try_get::<i64, _>(column)
                .map(|value| value.max(0) as u64)
                .map_err(db_error)
        };

        Ok(EntityCounts {
            coins: count("coins")?,
            platforms: count("platforms")?,
            contract_addresses: count("contract_addresses")?,
            tags: count("tags")?,
            urls: count("urls")?,
            coin_tags: count("coin_tags")?,
            coin_urls: count("coin_urls")?,
            coin_contract_addresses: count("coin_contract_addresses")?,
        })
    }
}
