use super::{format_ts, parse_ts, SqliteStore};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, Row};
use swapledger_core_types::{FeeValuation, Platform, Swap, SwapSource};

const INSERT_SWAP_SQL: &str = "INSERT OR IGNORE INTO swaps(
        source,
        tx_id,
        ts,
        date_bucket,
        user_address,
        in_asset,
        out_asset,
        in_amount,
        out_amount,
        in_amount_usd,
        out_amount_usd,
        in_price_usd,
        out_price_usd,
        total_fee_usd,
        network_fee_usd,
        liquidity_fee_usd,
        affiliate_fee_usd,
        affiliate_addresses_json,
        affiliate_fee_bps_json,
        platform,
        volume_tier,
        fee_valuation,
        block_height,
        swap_slip_bps,
        pools_json,
        is_streaming_swap,
        status,
        memo,
        raw_payload,
        ingested_at
    ) VALUES (
        ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
        ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30
    )";

const SELECT_SWAP_COLUMNS: &str = "source, tx_id, ts, date_bucket, user_address, in_asset,
    out_asset, in_amount, out_amount, in_amount_usd, out_amount_usd, in_price_usd,
    out_price_usd, total_fee_usd, network_fee_usd, liquidity_fee_usd, affiliate_fee_usd,
    affiliate_addresses_json, affiliate_fee_bps_json, platform, volume_tier, fee_valuation,
    block_height, swap_slip_bps, pools_json, is_streaming_swap, status, memo, raw_payload";

impl SqliteStore {
    /// Inserts the batch keyed by `(source, tx_id, ts)` and returns how many
    /// rows were new. Existing rows are never modified, and duplicates inside
    /// the batch are absorbed by the same conflict rule.
    pub fn upsert_swaps(&self, swaps: &[Swap]) -> Result<usize> {
        if swaps.is_empty() {
            return Ok(0);
        }
        let encoded = swaps
            .iter()
            .map(EncodedSwap::from_swap)
            .collect::<Result<Vec<_>>>()?;
        let ingested_at = format_ts(Utc::now());

        self.with_immediate_transaction("swap upsert", |conn| {
            let mut stmt = conn
                .prepare_cached(INSERT_SWAP_SQL)
                .context("failed to prepare swap insert")?;
            let mut inserted = 0usize;
            for (swap, encoded) in swaps.iter().zip(&encoded) {
                inserted += stmt
                    .execute(params![
                        swap.source.as_str(),
                        &swap.tx_id,
                        &encoded.ts,
                        &encoded.date_bucket,
                        &swap.user_address,
                        &swap.in_asset,
                        &swap.out_asset,
                        swap.in_amount,
                        swap.out_amount,
                        swap.in_amount_usd,
                        swap.out_amount_usd,
                        swap.in_price_usd,
                        swap.out_price_usd,
                        swap.total_fee_usd,
                        swap.network_fee_usd,
                        swap.liquidity_fee_usd,
                        swap.affiliate_fee_usd,
                        &encoded.affiliate_addresses,
                        &encoded.affiliate_fee_bps,
                        swap.platform.as_str(),
                        &swap.volume_tier,
                        swap.fee_valuation.map(FeeValuation::as_str),
                        encoded.block_height,
                        swap.swap_slip_bps,
                        &encoded.pools,
                        swap.is_streaming_swap,
                        &swap.status,
                        swap.memo.as_deref(),
                        &encoded.raw_payload,
                        &ingested_at,
                    ])
                    .with_context(|| {
                        format!(
                            "failed to insert swap source={} tx_id={}",
                            swap.source, swap.tx_id
                        )
                    })?;
            }
            Ok(inserted)
        })
        .context("failed to upsert swap batch")
    }

    pub fn swap_count(&self, source: Option<SwapSource>) -> Result<u64> {
        let count: i64 = match source {
            Some(source) => self.conn.query_row(
                "SELECT COUNT(*) FROM swaps WHERE source = ?1",
                params![source.as_str()],
                |row| row.get(0),
            ),
            None => self
                .conn
                .query_row("SELECT COUNT(*) FROM swaps", [], |row| row.get(0)),
        }
        .context("failed to count swaps")?;
        Ok(count.max(0) as u64)
    }

    pub fn newest_swap_timestamp(&self, source: SwapSource) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT MAX(ts) FROM swaps WHERE source = ?1",
                params![source.as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read newest swap timestamp")?
            .flatten();
        raw.as_deref().map(parse_ts).transpose()
    }

    pub fn load_swap(&self, source: SwapSource, tx_id: &str) -> Result<Option<Swap>> {
        let sql = format!(
            "SELECT {SELECT_SWAP_COLUMNS} FROM swaps WHERE source = ?1 AND tx_id = ?2
             ORDER BY ts DESC LIMIT 1"
        );
        let raw = self
            .conn
            .query_row(&sql, params![source.as_str(), tx_id], StoredSwapRow::read)
            .optional()
            .context("failed to load swap")?;
        raw.map(StoredSwapRow::into_swap).transpose()
    }

    pub fn load_recent_swaps(&self, source: SwapSource, limit: usize) -> Result<Vec<Swap>> {
        let sql = format!(
            "SELECT {SELECT_SWAP_COLUMNS} FROM swaps WHERE source = ?1
             ORDER BY ts DESC, id DESC LIMIT ?2"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("failed to prepare recent swaps query")?;
        let rows = stmt
            .query_map(
                params![source.as_str(), limit.min(i64::MAX as usize) as i64],
                StoredSwapRow::read,
            )
            .context("failed to query recent swaps")?;
        let mut swaps = Vec::new();
        for row in rows {
            swaps.push(row.context("failed to read swap row")?.into_swap()?);
        }
        Ok(swaps)
    }
}

struct EncodedSwap {
    ts: String,
    date_bucket: String,
    affiliate_addresses: String,
    affiliate_fee_bps: String,
    pools: String,
    raw_payload: String,
    block_height: Option<i64>,
}

impl EncodedSwap {
    fn from_swap(swap: &Swap) -> Result<Self> {
        if !swap.has_affiliate_parity() {
            return Err(anyhow!(
                "swap source={} tx_id={} has {} affiliates but {} bps entries",
                swap.source,
                swap.tx_id,
                swap.affiliate_addresses.len(),
                swap.affiliate_fee_bps.len()
            ));
        }
        Ok(Self {
            ts: format_ts(swap.timestamp),
            date_bucket: swap.date_bucket.format("%Y-%m-%d").to_string(),
            affiliate_addresses: serde_json::to_string(&swap.affiliate_addresses)
                .context("failed to encode affiliate addresses")?,
            affiliate_fee_bps: serde_json::to_string(&swap.affiliate_fee_bps)
                .context("failed to encode affiliate bps")?,
            pools: serde_json::to_string(&swap.pools).context("failed to encode pools")?,
            raw_payload: swap.raw_payload.to_string(),
            block_height: swap
                .block_height
                .map(|height| height.min(i64::MAX as u64) as i64),
        })
    }
}

struct StoredSwapRow {
    source: String,
    tx_id: String,
    ts: String,
    date_bucket: String,
    user_address: String,
    in_asset: String,
    out_asset: String,
    in_amount: f64,
    out_amount: f64,
    in_amount_usd: f64,
    out_amount_usd: f64,
    in_price_usd: Option<f64>,
    out_price_usd: Option<f64>,
    total_fee_usd: f64,
    network_fee_usd: f64,
    liquidity_fee_usd: f64,
    affiliate_fee_usd: f64,
    affiliate_addresses: String,
    affiliate_fee_bps: String,
    platform: String,
    volume_tier: String,
    fee_valuation: Option<String>,
    block_height: Option<i64>,
    swap_slip_bps: Option<u32>,
    pools: String,
    is_streaming_swap: bool,
    status: String,
    memo: Option<String>,
    raw_payload: String,
}

impl StoredSwapRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            source: row.get(0)?,
            tx_id: row.get(1)?,
            ts: row.get(2)?,
            date_bucket: row.get(3)?,
            user_address: row.get(4)?,
            in_asset: row.get(5)?,
            out_asset: row.get(6)?,
            in_amount: row.get(7)?,
            out_amount: row.get(8)?,
            in_amount_usd: row.get(9)?,
            out_amount_usd: row.get(10)?,
            in_price_usd: row.get(11)?,
            out_price_usd: row.get(12)?,
            total_fee_usd: row.get(13)?,
            network_fee_usd: row.get(14)?,
            liquidity_fee_usd: row.get(15)?,
            affiliate_fee_usd: row.get(16)?,
            affiliate_addresses: row.get(17)?,
            affiliate_fee_bps: row.get(18)?,
            platform: row.get(19)?,
            volume_tier: row.get(20)?,
            fee_valuation: row.get(21)?,
            block_height: row.get(22)?,
            swap_slip_bps: row.get(23)?,
            pools: row.get(24)?,
            is_streaming_swap: row.get(25)?,
            status: row.get(26)?,
            memo: row.get(27)?,
            raw_payload: row.get(28)?,
        })
    }

    fn into_swap(self) -> Result<Swap> {
        let source = self
            .source
            .parse::<SwapSource>()
            .map_err(|error| anyhow!("stored swap row: {error}"))?;
        let platform = self
            .platform
            .parse::<Platform>()
            .map_err(|error| anyhow!("stored swap row: {error}"))?;
        let fee_valuation = self
            .fee_valuation
            .as_deref()
            .map(|value| value.parse::<FeeValuation>())
            .transpose()
            .map_err(|error| anyhow!("stored swap row: {error}"))?;
        Ok(Swap {
            source,
            timestamp: parse_ts(&self.ts)?,
            date_bucket: NaiveDate::parse_from_str(&self.date_bucket, "%Y-%m-%d")
                .with_context(|| format!("invalid stored date bucket: {}", self.date_bucket))?,
            affiliate_addresses: serde_json::from_str(&self.affiliate_addresses)
                .context("invalid stored affiliate addresses")?,
            affiliate_fee_bps: serde_json::from_str(&self.affiliate_fee_bps)
                .context("invalid stored affiliate bps")?,
            pools: serde_json::from_str(&self.pools).context("invalid stored pools")?,
            raw_payload: serde_json::from_str(&self.raw_payload)
                .context("invalid stored raw payload")?,
            block_height: self.block_height.map(|height| height.max(0) as u64),
            platform,
            fee_valuation,
            tx_id: self.tx_id,
            user_address: self.user_address,
            in_asset: self.in_asset,
            out_asset: self.out_asset,
            in_amount: self.in_amount,
            out_amount: self.out_amount,
            in_amount_usd: self.in_amount_usd,
            out_amount_usd: self.out_amount_usd,
            in_price_usd: self.in_price_usd,
            out_price_usd: self.out_price_usd,
            total_fee_usd: self.total_fee_usd,
            network_fee_usd: self.network_fee_usd,
            liquidity_fee_usd: self.liquidity_fee_usd,
            affiliate_fee_usd: self.affiliate_fee_usd,
            volume_tier: self.volume_tier,
            swap_slip_bps: self.swap_slip_bps,
            is_streaming_swap: self.is_streaming_swap,
            status: self.status,
            memo: self.memo,
        })
    }
}
