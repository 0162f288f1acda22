use reshard_store::{
    CleanedRow, CoordinateRow, KeyCount, Rows, Shard, Source, StoreError, StoreRow, Table,
    UuidBackfill,
};
use std::collections::HashMap;

pub fn cleaned(id: i64, code: Option<&str>) -> CleanedRow {
    CleanedRow {
        id,
        institution_code: code.map(str::to_owned),
        store_name: Some(format!("store-{id}")),
        region: Some("Seoul Jongno-gu".to_owned()),
        address: Some(format!("{id} Sejong-daero")),
        longitude: Some(10.5),
        latitude: Some(20.25),
        ..Default::default()
    }
}

pub fn store(id: i64, code: Option<&str>) -> StoreRow {
    StoreRow {
        id,
        affiliate_name: Some(format!("affiliate-{id}")),
        local_bill: Some("Seoul Love".to_owned()),
        instt_code: code.map(str::to_owned),
        ..Default::default()
    }
}

pub fn coordinate(id: i64, cleaned_id: i64) -> CoordinateRow {
    CoordinateRow {
        id,
        cleaned_id,
        lon: Some(10.5),
        lat: Some(20.25),
        institution_code: None,
    }
}

pub async fn test_read_pages(source: &dyn Source, seed: &dyn Shard) -> anyhow::Result<()> {
    seed.upsert(&(1..=5).map(|id| cleaned(id, Some("100"))).collect::<Vec<_>>().into())
        .await?;

    assert_eq!(source.read(Table::Cleaned, 0, 2).await?.ids(), vec![1, 2]);
    assert_eq!(source.read(Table::Cleaned, 2, 2).await?.ids(), vec![3, 4]);
    assert_eq!(source.read(Table::Cleaned, 4, 10).await?.ids(), vec![5]);
    assert!(source.read(Table::Cleaned, 5, 10).await?.is_empty());
    assert!(source.read(Table::Store, 0, 10).await?.is_empty());

    Ok(())
}

pub async fn test_coordinate_join(source: &dyn Source, seed: &dyn Shard) -> anyhow::Result<()> {
    seed.upsert(&vec![cleaned(1, Some("100")), cleaned(2, None)].into())
        .await?;

    seed.set_foreign_key_checks(false).await?;
    seed.upsert(&vec![coordinate(10, 1), coordinate(11, 999), coordinate(12, 2)].into())
        .await?;
    seed.set_foreign_key_checks(true).await?;

    let Rows::Coordinate(rows) = source.read(Table::Coordinate, 0, 10).await? else {
        panic!("expected coordinate rows");
    };

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].id, 10);
    assert_eq!(rows[0].institution_code.as_deref(), Some("100"));
    assert_eq!(rows[0].lon, Some(10.5));
    assert_eq!(rows[0].lat, Some(20.25));
    assert_eq!(rows[1].id, 12);
    assert_eq!(rows[1].institution_code, None);

    Ok(())
}

pub async fn test_upsert_idempotent(shard: &dyn Shard, view: &dyn Source) -> anyhow::Result<()> {
    let rows: Rows = vec![store(1, Some("100")), store(2, Some("200"))].into();

    shard.upsert(&rows).await?;
    shard.upsert(&rows).await?;

    assert_eq!(view.read(Table::Store, 0, 10).await?, rows);

    let mut renamed = store(2, Some("200"));
    renamed.affiliate_name = Some("renamed".to_owned());
    shard.upsert(&vec![renamed.clone()].into()).await?;

    assert_eq!(
        view.read(Table::Store, 0, 10).await?,
        vec![store(1, Some("100")), renamed].into()
    );

    Ok(())
}

pub async fn test_foreign_keys(shard: &dyn Shard) -> anyhow::Result<()> {
    let orphan: Rows = vec![coordinate(1, 404)].into();

    assert!(shard.upsert(&orphan).await.is_err());

    shard.set_foreign_key_checks(false).await?;
    shard.upsert(&orphan).await?;
    shard.set_foreign_key_checks(true).await?;

    Ok(())
}

pub async fn test_shard_map(source: &dyn Source) -> anyhow::Result<()> {
    source.ensure_shard_map().await?;
    source.ensure_shard_map().await?;

    source
        .upsert_shard_map(&[("100".to_owned(), 1), ("200".to_owned(), 2)])
        .await?;
    source.upsert_shard_map(&[("100".to_owned(), 3)]).await?;

    assert_eq!(
        source.load_shard_map().await?,
        HashMap::from([("100".to_owned(), 3), ("200".to_owned(), 2)])
    );

    Ok(())
}

pub async fn test_key_counts(source: &dyn Source, seed: &dyn Shard) -> anyhow::Result<()> {
    seed.upsert(
        &vec![
            cleaned(1, Some("100")),
            cleaned(2, Some("200")),
            cleaned(3, Some("100")),
            cleaned(4, Some("")),
            cleaned(5, None),
            cleaned(6, Some("100")),
        ]
        .into(),
    )
    .await?;

    let mut counts = source
        .key_counts("local_store_cleaned", "institution_code")
        .await?;
    counts.sort_by(|a, b| a.key.cmp(&b.key));

    assert_eq!(
        counts,
        vec![
            KeyCount {
                key: "100".to_owned(),
                count: 3
            },
            KeyCount {
                key: "200".to_owned(),
                count: 1
            },
        ]
    );

    let err = source
        .key_counts("local_store_cleaned", "code; DROP TABLE shard_map")
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidIdentifier(_)));

    Ok(())
}

pub async fn test_fill_missing_uuids(source: &dyn Source, seed: &dyn Shard) -> anyhow::Result<()> {
    seed.upsert(&vec![cleaned(1, Some("100")), cleaned(2, Some("200"))].into())
        .await?;

    let fill = source.fill_missing_uuids("local_store_cleaned").await?;
    assert_eq!((fill.missing, fill.updated), (2, 2));

    let fill = seed.fill_missing_uuids("local_store_cleaned").await?;
    assert_eq!((fill.missing, fill.updated), (0, 0));

    Ok(())
}
