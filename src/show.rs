use anyhow::{bail, Result};
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::textgen::format_usd;

/// Print one adviser with its narrative, filings, people, and funds.
pub async fn run_show(config: &Config, crd: &str) -> Result<()> {
    let pool = db::connect(config).await?;

    let adviser = sqlx::query(
        r#"
        SELECT crd_number, legal_name, sec_number, city, state, phone, fax,
               website, aum, employee_count, services, client_types,
               private_fund_count, private_fund_aum
        FROM advisers WHERE crd_number = ?
        "#,
    )
    .bind(crd)
    .fetch_optional(&pool)
    .await?;

    let row = match adviser {
        Some(row) => row,
        None => {
            pool.close().await;
            bail!("Adviser not found: {}", crd);
        }
    };

    let name: Option<String> = row.get("legal_name");
    println!("{}", name.as_deref().unwrap_or("(unnamed)"));
    println!("  crd: {}", crd);
    print_field(&row, "sec_number", "sec");
    let city: Option<String> = row.get("city");
    let state: Option<String> = row.get("state");
    if city.is_some() || state.is_some() {
        println!(
            "  location: {}",
            [city, state].into_iter().flatten().collect::<Vec<_>>().join(", ")
        );
    }
    print_field(&row, "phone", "phone");
    print_field(&row, "fax", "fax");
    print_field(&row, "website", "website");
    if let Some(aum) = row.get::<Option<i64>, _>("aum") {
        println!("  aum: {}", format_usd(aum));
    }
    if let Some(employees) = row.get::<Option<i64>, _>("employee_count") {
        println!("  employees: {}", employees);
    }
    print_field(&row, "services", "services");
    print_field(&row, "client_types", "clients");

    let fund_count: i64 = row.get("private_fund_count");
    if fund_count > 0 {
        let fund_aum: i64 = row.get("private_fund_aum");
        println!(
            "  private funds: {} ({} gross assets)",
            fund_count,
            format_usd(fund_aum)
        );
    }

    let narrative = sqlx::query(
        r#"
        SELECT narrative_text, source, embedding IS NOT NULL AS embedded
        FROM narratives WHERE adviser_crd = ? AND narrative_type = 'profile'
        "#,
    )
    .bind(crd)
    .fetch_optional(&pool)
    .await?;

    println!();
    match narrative {
        Some(n) => {
            let text: String = n.get("narrative_text");
            let source: String = n.get("source");
            let embedded: bool = n.get("embedded");
            println!("narrative ({}, {}):", source, if embedded { "embedded" } else { "no vector" });
            println!("  {}", text);
        }
        None => println!("narrative: none"),
    }

    let filings = sqlx::query(
        "SELECT filing_id, filing_date, filing_period FROM filings WHERE adviser_crd = ? ORDER BY filing_date DESC",
    )
    .bind(crd)
    .fetch_all(&pool)
    .await?;

    if !filings.is_empty() {
        println!();
        println!("filings:");
        for f in &filings {
            let id: i64 = f.get("filing_id");
            let date: Option<String> = f.get("filing_date");
            let period: Option<String> = f.get("filing_period");
            println!(
                "  {} — {} ({})",
                id,
                date.as_deref().unwrap_or("?"),
                period.as_deref().unwrap_or("?")
            );
        }
    }

    let people = sqlx::query(
        "SELECT person_name, title, ownership_percent FROM control_persons WHERE adviser_crd = ? ORDER BY person_name",
    )
    .bind(crd)
    .fetch_all(&pool)
    .await?;

    if !people.is_empty() {
        println!();
        println!("control persons:");
        for p in &people {
            let pname: String = p.get("person_name");
            let title: String = p.get("title");
            match p.get::<Option<f64>, _>("ownership_percent") {
                Some(pct) => println!("  {} — {} ({}%)", pname, title, pct),
                None => println!("  {} — {}", pname, title),
            }
        }
    }

    let funds = sqlx::query(
        "SELECT fund_name, fund_type, gross_asset_value FROM private_funds WHERE adviser_crd = ? ORDER BY gross_asset_value DESC",
    )
    .bind(crd)
    .fetch_all(&pool)
    .await?;

    if !funds.is_empty() {
        println!();
        println!("private funds:");
        for f in &funds {
            let fname: Option<String> = f.get("fund_name");
            let ftype: Option<String> = f.get("fund_type");
            let gav: Option<i64> = f.get("gross_asset_value");
            println!(
                "  {} — {} ({})",
                fname.as_deref().unwrap_or("(unnamed)"),
                ftype.as_deref().unwrap_or("?"),
                gav.map(format_usd).unwrap_or_else(|| "?".to_string())
            );
        }
    }

    pool.close().await;
    Ok(())
}

fn print_field(row: &sqlx::sqlite::SqliteRow, column: &str, label: &str) {
    if let Some(value) = row.get::<Option<String>, _>(column) {
        println!("  {}: {}", label, value);
    }
}
