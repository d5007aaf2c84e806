//! Idempotent writes into the adviser tables.
//!
//! The upsert writer owns all writes to `advisers`, `filings`,
//! `control_persons`, and `private_funds`. Conflicts resolve on the natural
//! key; partial records never null out previously known fields; per-record
//! failures are reported in the batch result instead of aborting siblings.
//! Nothing here triggers narrative or embedding work; downstream stages
//! find their own pending rows.

use anyhow::Result;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};

use crate::models::{
    AdviserRecord, ControlPersonRecord, PrivateFundRecord, UpsertFailure, UpsertResult,
};

/// Upsert a batch of adviser records.
///
/// Within the batch, records sharing a natural key collapse to the one
/// with the highest non-null AUM (ties keep the later record). Each
/// surviving record is written individually so one constraint violation
/// cannot take down the batch.
pub async fn upsert_advisers(pool: &SqlitePool, records: &[AdviserRecord]) -> Result<UpsertResult> {
    let (deduped, skipped) = dedup_batch(records);

    let mut result = UpsertResult {
        skipped,
        ..Default::default()
    };

    for record in &deduped {
        match upsert_one(pool, record).await {
            Ok(true) => result.inserted += 1,
            Ok(false) => result.updated += 1,
            Err(e) => result.failures.push(UpsertFailure {
                crd_number: record.crd_number.clone(),
                reason: e.to_string(),
            }),
        }
    }

    Ok(result)
}

/// Collapse duplicate natural keys within one batch.
///
/// Keeps the record with the highest non-null AUM; a record with no AUM
/// never displaces one that has it; exact ties and all-null ties keep the
/// later record in list order. Output preserves first-seen key order.
pub fn dedup_batch(records: &[AdviserRecord]) -> (Vec<AdviserRecord>, u64) {
    let mut order: Vec<String> = Vec::new();
    let mut by_key: HashMap<String, AdviserRecord> = HashMap::new();
    let mut skipped = 0u64;

    for record in records {
        match by_key.get(&record.crd_number) {
            None => {
                order.push(record.crd_number.clone());
                by_key.insert(record.crd_number.clone(), record.clone());
            }
            Some(existing) => {
                skipped += 1;
                let replace = match (record.aum, existing.aum) {
                    (Some(incoming), Some(kept)) => incoming >= kept,
                    (Some(_), None) => true,
                    (None, Some(_)) => false,
                    (None, None) => true,
                };
                if replace {
                    by_key.insert(record.crd_number.clone(), record.clone());
                }
            }
        }
    }

    let deduped = order
        .into_iter()
        .filter_map(|key| by_key.remove(&key))
        .collect();
    (deduped, skipped)
}

/// Insert or update one adviser. Returns true when the row was new.
async fn upsert_one(pool: &SqlitePool, record: &AdviserRecord) -> Result<bool, sqlx::Error> {
    let existing: Option<String> =
        sqlx::query_scalar("SELECT crd_number FROM advisers WHERE crd_number = ?")
            .bind(&record.crd_number)
            .fetch_optional(pool)
            .await?;

    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        r#"
        INSERT INTO advisers (
            crd_number, legal_name, sec_number, street1, street2, city, state,
            postal, phone, fax, website, aum, employee_count, services,
            client_types, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(crd_number) DO UPDATE SET
            legal_name = COALESCE(excluded.legal_name, advisers.legal_name),
            sec_number = COALESCE(excluded.sec_number, advisers.sec_number),
            street1 = COALESCE(excluded.street1, advisers.street1),
            street2 = COALESCE(excluded.street2, advisers.street2),
            city = COALESCE(excluded.city, advisers.city),
            state = COALESCE(excluded.state, advisers.state),
            postal = COALESCE(excluded.postal, advisers.postal),
            phone = COALESCE(excluded.phone, advisers.phone),
            fax = COALESCE(excluded.fax, advisers.fax),
            website = COALESCE(excluded.website, advisers.website),
            aum = COALESCE(excluded.aum, advisers.aum),
            employee_count = COALESCE(excluded.employee_count, advisers.employee_count),
            services = COALESCE(excluded.services, advisers.services),
            client_types = COALESCE(excluded.client_types, advisers.client_types),
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&record.crd_number)
    .bind(&record.legal_name)
    .bind(&record.sec_number)
    .bind(&record.street1)
    .bind(&record.street2)
    .bind(&record.city)
    .bind(&record.state)
    .bind(&record.postal)
    .bind(&record.phone)
    .bind(&record.fax)
    .bind(&record.website)
    .bind(record.aum)
    .bind(record.employee_count)
    .bind(&record.services)
    .bind(&record.client_types)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(existing.is_none())
}

/// Write one filing row per distinct `FilingID` carried by the batch.
pub async fn upsert_filings(pool: &SqlitePool, records: &[AdviserRecord]) -> Result<u64> {
    let now = chrono::Utc::now().timestamp();
    let mut written = 0u64;
    let mut seen: HashSet<i64> = HashSet::new();

    for record in records {
        let filing_id = match record.filing_id {
            Some(id) if seen.insert(id) => id,
            _ => continue,
        };

        sqlx::query(
            r#"
            INSERT INTO filings (
                filing_id, adviser_crd, filing_date, filing_period, form_type,
                total_aum, employee_count, source_file, ingested_at
            )
            VALUES (?, ?, ?, ?, 'ADV', ?, ?, ?, ?)
            ON CONFLICT(filing_id) DO UPDATE SET
                adviser_crd = excluded.adviser_crd,
                filing_date = COALESCE(excluded.filing_date, filings.filing_date),
                filing_period = COALESCE(excluded.filing_period, filings.filing_period),
                total_aum = COALESCE(excluded.total_aum, filings.total_aum),
                employee_count = COALESCE(excluded.employee_count, filings.employee_count),
                source_file = COALESCE(excluded.source_file, filings.source_file),
                ingested_at = excluded.ingested_at
            "#,
        )
        .bind(filing_id)
        .bind(&record.crd_number)
        .bind(&record.filing_date)
        .bind(&record.filing_period)
        .bind(record.aum)
        .bind(record.employee_count)
        .bind(&record.source_file)
        .bind(now)
        .execute(pool)
        .await?;

        written += 1;
    }

    Ok(written)
}

/// Upsert control persons. Re-ingesting the same period is suppressed by
/// the `(adviser, name, title)` uniqueness; a later filing supersedes the
/// ownership details for the same person.
pub async fn upsert_control_persons(
    pool: &SqlitePool,
    records: &[ControlPersonRecord],
) -> Result<u64> {
    let now = chrono::Utc::now().timestamp();
    let mut written = 0u64;

    for record in records {
        sqlx::query(
            r#"
            INSERT INTO control_persons (
                adviser_crd, filing_id, person_name, title, ownership_code,
                ownership_percent, ingested_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(adviser_crd, person_name, title) DO UPDATE SET
                filing_id = excluded.filing_id,
                ownership_code = excluded.ownership_code,
                ownership_percent = excluded.ownership_percent,
                ingested_at = excluded.ingested_at
            "#,
        )
        .bind(&record.adviser_crd)
        .bind(record.filing_id)
        .bind(&record.person_name)
        .bind(&record.title)
        .bind(&record.ownership_code)
        .bind(record.ownership_percent)
        .bind(now)
        .execute(pool)
        .await?;

        written += 1;
    }

    Ok(written)
}

/// Upsert private funds, then refresh the per-adviser summary counters.
pub async fn upsert_private_funds(
    pool: &SqlitePool,
    records: &[PrivateFundRecord],
) -> Result<u64> {
    let mut written = 0u64;
    let mut touched: HashSet<String> = HashSet::new();

    for record in records {
        sqlx::query(
            r#"
            INSERT INTO private_funds (
                adviser_crd, filing_id, reference_id, fund_name, fund_type,
                gross_asset_value, min_investment, is_master_fund,
                is_fund_of_funds, exclusion_type
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(adviser_crd, filing_id, reference_id) DO UPDATE SET
                fund_name = excluded.fund_name,
                fund_type = excluded.fund_type,
                gross_asset_value = excluded.gross_asset_value,
                min_investment = excluded.min_investment,
                is_master_fund = excluded.is_master_fund,
                is_fund_of_funds = excluded.is_fund_of_funds,
                exclusion_type = excluded.exclusion_type
            "#,
        )
        .bind(&record.adviser_crd)
        .bind(record.filing_id)
        .bind(&record.reference_id)
        .bind(&record.fund_name)
        .bind(&record.fund_type)
        .bind(record.gross_asset_value)
        .bind(record.min_investment)
        .bind(record.is_master_fund.map(|b| b as i64))
        .bind(record.is_fund_of_funds.map(|b| b as i64))
        .bind(&record.exclusion_type)
        .execute(pool)
        .await?;

        written += 1;
        touched.insert(record.adviser_crd.clone());
    }

    for crd in &touched {
        sqlx::query(
            r#"
            UPDATE advisers SET
                private_fund_count = (
                    SELECT COUNT(*) FROM private_funds WHERE adviser_crd = ?1
                ),
                private_fund_aum = COALESCE((
                    SELECT SUM(gross_asset_value) FROM private_funds WHERE adviser_crd = ?1
                ), 0)
            WHERE crd_number = ?1
            "#,
        )
        .bind(crd)
        .execute(pool)
        .await?;
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(crd: &str, aum: Option<i64>) -> AdviserRecord {
        AdviserRecord {
            crd_number: crd.to_string(),
            aum,
            ..Default::default()
        }
    }

    #[test]
    fn dedup_keeps_highest_aum() {
        let batch = vec![record("100", Some(0)), record("100", Some(5_000_000))];
        let (deduped, skipped) = dedup_batch(&batch);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].aum, Some(5_000_000));
        assert_eq!(skipped, 1);
    }

    #[test]
    fn dedup_null_never_displaces_value() {
        let batch = vec![record("100", Some(42)), record("100", None)];
        let (deduped, _) = dedup_batch(&batch);
        assert_eq!(deduped[0].aum, Some(42));
    }

    #[test]
    fn dedup_tie_keeps_later_record() {
        let mut first = record("100", Some(10));
        first.city = Some("FIRST".into());
        let mut second = record("100", Some(10));
        second.city = Some("SECOND".into());

        let (deduped, _) = dedup_batch(&[first, second]);
        assert_eq!(deduped[0].city.as_deref(), Some("SECOND"));
    }

    #[test]
    fn dedup_preserves_first_seen_order() {
        let batch = vec![
            record("300", None),
            record("100", None),
            record("300", Some(1)),
            record("200", None),
        ];
        let (deduped, skipped) = dedup_batch(&batch);
        let keys: Vec<&str> = deduped.iter().map(|r| r.crd_number.as_str()).collect();
        assert_eq!(keys, vec!["300", "100", "200"]);
        assert_eq!(skipped, 1);
    }
}
