//! Engine settings management

use crate::db::sqlite::models::EngineSettings;
use crate::error::Result;
use rusqlite::Connection;

/// Partial update of the engine settings
#[derive(Debug, Clone, Default)]
pub struct SettingsUpdate {
    pub grading_interval_ms: Option<u64>,
    pub persist_retry_initial_ms: Option<u64>,
    pub persist_retry_max_ms: Option<u64>,
    pub capture_retry_delays_ms: Option<Vec<u64>>,
    pub max_quote_age_secs: Option<u64>,
}

/// Get engine settings
pub fn get_engine_settings(conn: &Connection) -> Result<EngineSettings> {
    let (grading_interval_ms, retry_initial, retry_max, delays_json, max_age) =
        conn.query_row(
            "SELECT grading_interval_ms, persist_retry_initial_ms,
                    persist_retry_max_ms, capture_retry_delays_ms, max_quote_age_secs
             FROM settings WHERE id = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            },
        )?;

    let capture_retry_delays_ms: Vec<u64> = serde_json::from_str(&delays_json)?;

    Ok(EngineSettings {
        grading_interval_ms: grading_interval_ms.max(0) as u64,
        persist_retry_initial_ms: retry_initial.max(0) as u64,
        persist_retry_max_ms: retry_max.max(0) as u64,
        capture_retry_delays_ms,
        max_quote_age_secs: max_age.max(0) as u64,
    })
}

/// Update engine settings
pub fn update_engine_settings(conn: &Connection, update: &SettingsUpdate) -> Result<EngineSettings> {
    let mut updates = Vec::new();
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(v) = update.grading_interval_ms {
        updates.push("grading_interval_ms = ?");
        params.push(Box::new(v as i64));
    }
    if let Some(v) = update.persist_retry_initial_ms {
        updates.push("persist_retry_initial_ms = ?");
        params.push(Box::new(v as i64));
    }
    if let Some(v) = update.persist_retry_max_ms {
        updates.push("persist_retry_max_ms = ?");
        params.push(Box::new(v as i64));
    }
    if let Some(ref v) = update.capture_retry_delays_ms {
        updates.push("capture_retry_delays_ms = ?");
        params.push(Box::new(serde_json::to_string(v)?));
    }
    if let Some(v) = update.max_quote_age_secs {
        updates.push("max_quote_age_secs = ?");
        params.push(Box::new(v as i64));
    }

    if !updates.is_empty() {
        updates.push("updated_at = datetime('now')");
        let sql = format!("UPDATE settings SET {} WHERE id = 1", updates.join(", "));
        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        conn.execute(&sql, params_refs.as_slice())?;
    }

    get_engine_settings(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::migrations::run_migrations;

    #[test]
    fn test_defaults_match_model() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(get_engine_settings(&conn).unwrap(), EngineSettings::default());
    }

    #[test]
    fn test_partial_update() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let settings = update_engine_settings(
            &conn,
            &SettingsUpdate {
                grading_interval_ms: Some(250),
                capture_retry_delays_ms: Some(vec![100, 200]),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(settings.grading_interval_ms, 250);
        assert_eq!(settings.capture_retry_delays_ms, vec![100, 200]);
        assert_eq!(settings.persist_retry_initial_ms, 500);
    }

    #[test]
    fn test_corrupt_retry_delays_reported() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute("UPDATE settings SET capture_retry_delays_ms = 'soon'", []).unwrap();

        assert!(matches!(
            get_engine_settings(&conn),
            Err(crate::error::AppError::Serialization(_))
        ));
    }
}
