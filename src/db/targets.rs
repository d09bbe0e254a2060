use chrono::{DateTime, Utc};
use rusqlite::params;
use tokio_rusqlite::Connection;

use crate::core::models::{S3Config, Target, TargetConfig, TargetKind, WebDavConfig};
use crate::error::{Result, SyncError};

/// Create a target with its typed config sub-record in one transaction.
pub async fn create(
    conn: &Connection,
    name: String,
    config: TargetConfig,
    now: DateTime<Utc>,
) -> Result<i64> {
    config.validate()?;

    let id = conn
        .call(move |c| {
            let tx = c.transaction()?;

            tx.execute(
                "INSERT INTO targets (name, kind, enabled, created_at, updated_at)
                 VALUES (?1, ?2, 1, ?3, ?3)",
                params![name, config.kind().as_str(), now],
            )?;
            let target_id = tx.last_insert_rowid();

            match &config {
                TargetConfig::Webdav(webdav) => {
                    tx.execute(
                        "INSERT INTO webdav_configs (url, username, password, target_id)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![webdav.url, webdav.username, webdav.password, target_id],
                    )?;
                }
                TargetConfig::S3(s3) => {
                    tx.execute(
                        "INSERT INTO s3_configs
                             (endpoint, access_key_id, secret_access_key, region, bucket, target_id)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![
                            s3.endpoint,
                            s3.access_key_id,
                            s3.secret_access_key,
                            s3.region,
                            s3.bucket,
                            target_id
                        ],
                    )?;
                }
            }

            tx.commit()?;
            Ok(target_id)
        })
        .await?;

    Ok(id)
}

pub async fn get(conn: &Connection, id: i64) -> Result<Option<Target>> {
    let rows = conn
        .call(move |c| {
            load_targets(
                c,
                "SELECT id, name, kind, enabled, created_at, updated_at
                 FROM targets WHERE id = ?1",
                params![id],
            )
        })
        .await?;

    Ok(rows.into_iter().next())
}

pub async fn list(conn: &Connection) -> Result<Vec<Target>> {
    let rows = conn
        .call(|c| {
            load_targets(
                c,
                "SELECT id, name, kind, enabled, created_at, updated_at
                 FROM targets ORDER BY id",
                params![],
            )
        })
        .await?;
    Ok(rows)
}

pub async fn list_enabled(conn: &Connection) -> Result<Vec<Target>> {
    let rows = conn
        .call(|c| {
            load_targets(
                c,
                "SELECT id, name, kind, enabled, created_at, updated_at
                 FROM targets WHERE enabled = 1 ORDER BY id",
                params![],
            )
        })
        .await?;
    Ok(rows)
}

pub async fn set_enabled(
    conn: &Connection,
    id: i64,
    enabled: bool,
    now: DateTime<Utc>,
) -> Result<()> {
    let changed = conn
        .call(move |c| {
            let n = c.execute(
                "UPDATE targets SET enabled = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, enabled, now],
            )?;
            Ok(n)
        })
        .await?;

    if changed == 0 {
        return Err(SyncError::Config(format!("target {id} does not exist")));
    }
    Ok(())
}

pub async fn rename(conn: &Connection, id: i64, name: String, now: DateTime<Utc>) -> Result<()> {
    let changed = conn
        .call(move |c| {
            let n = c.execute(
                "UPDATE targets SET name = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, name, now],
            )?;
            Ok(n)
        })
        .await?;

    if changed == 0 {
        return Err(SyncError::Config(format!("target {id} does not exist")));
    }
    Ok(())
}

/// Delete a target. The config sub-record cascades; job history survives
/// with a NULL target reference.
pub async fn delete(conn: &Connection, id: i64) -> Result<()> {
    conn.call(move |c| {
        c.execute("DELETE FROM targets WHERE id = ?1", params![id])?;
        Ok(())
    })
    .await?;
    Ok(())
}

fn load_targets(
    c: &mut rusqlite::Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> tokio_rusqlite::Result<Vec<Target>> {
    let base: Vec<(i64, String, String, bool, DateTime<Utc>, DateTime<Utc>)> = {
        let mut stmt = c.prepare(sql)?;
        let rows = stmt.query_map(args, |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
            ))
        })?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    let mut targets = Vec::with_capacity(base.len());
    for (id, name, kind_text, enabled, created_at, updated_at) in base {
        let kind = parse_column(2, &kind_text, TargetKind::parse)?;
        let config = load_config(c, id, kind)?;
        targets.push(Target {
            id,
            name,
            kind,
            enabled,
            config,
            created_at,
            updated_at,
        });
    }
    Ok(targets)
}

fn load_config(
    c: &rusqlite::Connection,
    target_id: i64,
    kind: TargetKind,
) -> tokio_rusqlite::Result<TargetConfig> {
    let config = match kind {
        TargetKind::Webdav => c.query_row(
            "SELECT url, username, password FROM webdav_configs WHERE target_id = ?1",
            params![target_id],
            |row| {
                Ok(TargetConfig::Webdav(WebDavConfig {
                    url: row.get(0)?,
                    username: row.get(1)?,
                    password: row.get(2)?,
                }))
            },
        )?,
        TargetKind::S3 => c.query_row(
            "SELECT endpoint, access_key_id, secret_access_key, region, bucket
             FROM s3_configs WHERE target_id = ?1",
            params![target_id],
            |row| {
                Ok(TargetConfig::S3(S3Config {
                    endpoint: row.get(0)?,
                    access_key_id: row.get(1)?,
                    secret_access_key: row.get(2)?,
                    region: row.get(3)?,
                    bucket: row.get(4)?,
                }))
            },
        )?,
    };
    Ok(config)
}

pub(crate) fn parse_column<T>(
    idx: usize,
    text: &str,
    parse: fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    parse(text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unrecognized value: {text}").into(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn webdav_config() -> TargetConfig {
        TargetConfig::Webdav(WebDavConfig {
            url: "https://dav.example.com/backups".into(),
            username: "vault".into(),
            password: "secret".into(),
        })
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let conn = db::open_in_memory().await.unwrap();
        let now = Utc::now();

        let id = create(&conn, "alpha".into(), webdav_config(), now)
            .await
            .unwrap();

        let target = get(&conn, id).await.unwrap().unwrap();
        assert_eq!(target.name, "alpha");
        assert_eq!(target.kind, TargetKind::Webdav);
        assert!(target.enabled);
        match &target.config {
            TargetConfig::Webdav(config) => {
                assert_eq!(config.url, "https://dav.example.com/backups")
            }
            other => panic!("expected webdav config, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn name_must_be_unique() {
        let conn = db::open_in_memory().await.unwrap();
        let now = Utc::now();

        create(&conn, "alpha".into(), webdav_config(), now)
            .await
            .unwrap();
        let duplicate = create(&conn, "alpha".into(), webdav_config(), now).await;
        assert!(duplicate.is_err());
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_insert() {
        let conn = db::open_in_memory().await.unwrap();
        let config = TargetConfig::S3(S3Config {
            endpoint: None,
            access_key_id: String::new(),
            secret_access_key: "s".into(),
            region: "us-east-1".into(),
            bucket: "b".into(),
        });

        let result = create(&conn, "bad".into(), config, Utc::now()).await;
        assert!(matches!(result, Err(SyncError::Config(_))));
        assert!(list(&conn).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn disabled_targets_are_filtered() {
        let conn = db::open_in_memory().await.unwrap();
        let now = Utc::now();

        let a = create(&conn, "a".into(), webdav_config(), now).await.unwrap();
        create(&conn, "b".into(), webdav_config(), now).await.unwrap();

        set_enabled(&conn, a, false, now).await.unwrap();

        let enabled = list_enabled(&conn).await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "b");
    }

    #[tokio::test]
    async fn delete_cascades_config() {
        let conn = db::open_in_memory().await.unwrap();
        let now = Utc::now();
        let id = create(&conn, "gone".into(), webdav_config(), now)
            .await
            .unwrap();

        delete(&conn, id).await.unwrap();
        assert!(get(&conn, id).await.unwrap().is_none());

        let orphans: i64 = conn
            .call(move |c| {
                let n = c.query_row(
                    "SELECT COUNT(*) FROM webdav_configs WHERE target_id = ?1",
                    params![id],
                    |row| row.get(0),
                )?;
                Ok(n)
            })
            .await
            .unwrap();
        assert_eq!(orphans, 0);
    }
}
