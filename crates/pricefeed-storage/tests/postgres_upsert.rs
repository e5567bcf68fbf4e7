// Runs against a real Postgres only when PRICEFEED_TEST_DATABASE_URL is set.

use chrono::{TimeZone, Utc};
use pricefeed_core::{DocType, PriceRow};
use pricefeed_storage::{PgPriceStore, PgStoreConfig, PgTarget, PriceStore};
use sqlx::{Connection, PgConnection, Row};

fn test_url() -> Option<String> {
    std::env::var("PRICEFEED_TEST_DATABASE_URL").ok()
}

fn row(provider: &str, product: &str, price: f64) -> PriceRow {
    PriceRow {
        provider: provider.into(),
        branch: "001".into(),
        doc_type: DocType::PricesFull,
        ts: Utc.with_ymd_and_hms(2024, 1, 5, 10, 0, 0).single().unwrap(),
        product: product.into(),
        unit: "unit".into(),
        price,
        src_key: None,
        etag: None,
    }
}

#[tokio::test]
async fn reupsert_touches_only_values_and_updated_at() {
    let Some(url) = test_url() else {
        return;
    };
    let store = PgPriceStore::new(&PgStoreConfig {
        target: PgTarget::Url(url.clone()),
        statement_timeout: None,
    })
    .expect("store");
    store.ensure_schema().await.expect("schema");
    store.ensure_schema().await.expect("schema is idempotent");
    store.probe().await.expect("probe");

    let provider = format!("it-{}", uuid::Uuid::new_v4());
    let rows = vec![row(&provider, "milk", 5.9), row(&provider, "bread", 7.5)];
    assert_eq!(store.upsert(&rows).await.expect("first upsert"), 2);
    assert_eq!(store.upsert(&rows).await.expect("second upsert"), 2);

    let mut conn = PgConnection::connect(&url).await.expect("connect");
    let found = sqlx::query(
        "SELECT product, price::float8 AS price FROM public.price_items WHERE provider = $1 ORDER BY product",
    )
    .bind(&provider)
    .fetch_all(&mut conn)
    .await
    .expect("select");
    assert_eq!(found.len(), 2);
    assert_eq!(found[0].get::<String, _>("product"), "bread");
    assert_eq!(found[1].get::<f64, _>("price"), 5.9);

    sqlx::query("DELETE FROM public.price_items WHERE provider = $1")
        .bind(&provider)
        .execute(&mut conn)
        .await
        .expect("cleanup");
}
