use std::collections::HashSet;
use std::time::Duration;

use sheetgres_core::{FieldMap, TablePair};

use crate::error::{ConfigError, ConfigResult};
use crate::settings::ProjectConfig;

/// Validate a project configuration. Any error here is fatal at startup.
pub fn validate(config: &ProjectConfig) -> ConfigResult<()> {
    if config.pairs.is_empty() {
        return Err(ConfigError::NoPairs);
    }

    let sync = &config.sync;
    if !(2..=120).contains(&sync.window_s) {
        return Err(ConfigError::InvalidWindow(sync.window_s));
    }
    if sync.poll_interval_s < 2 {
        return Err(ConfigError::PollTooShort(sync.poll_interval_s));
    }
    if sync.batch_size < 1 || sync.batch_size > sync.batch_cap {
        return Err(ConfigError::InvalidBatchSize {
            size: sync.batch_size,
            cap: sync.batch_cap,
        });
    }
    if !(0.0..=1.0).contains(&sync.pause_on_error_rate) {
        return Err(ConfigError::InvalidErrorRate(sync.pause_on_error_rate));
    }
    if sync.rate_limit_qps <= 0.0 {
        return Err(ConfigError::InvalidQps(sync.rate_limit_qps));
    }

    let mut names = HashSet::new();
    for pair in &config.pairs {
        let name = pair.name();
        if !names.insert(name.clone()) {
            return Err(ConfigError::DuplicatePair(name));
        }

        if let Some(interval) = pair.poll_interval_s {
            if interval < 2 {
                return Err(ConfigError::PollTooShort(interval));
            }
        }

        if !pair.fields.values().any(|column| column == &pair.key_field) {
            return Err(ConfigError::KeyFieldNotMapped {
                pair: name.clone(),
                key_field: pair.key_field.clone(),
            });
        }

        for column in &pair.multi_select {
            if !pair.fields.values().any(|mapped| mapped == column) {
                return Err(ConfigError::MultiSelectNotMapped {
                    pair: name.clone(),
                    column: column.clone(),
                });
            }
        }
    }

    Ok(())
}

/// Convert a validated config into the core table pairs.
pub fn to_pairs(config: &ProjectConfig) -> ConfigResult<Vec<TablePair>> {
    validate(config)?;

    config
        .pairs
        .iter()
        .map(|pair| {
            let field_map = FieldMap::new(
                pair.fields
                    .iter()
                    .map(|(sheet, db)| (sheet.clone(), db.clone()))
                    .collect(),
            )?
            .with_multi_select(pair.multi_select.clone());

            let interval = pair.poll_interval_s.unwrap_or(config.sync.poll_interval_s);

            Ok(TablePair::builder(&pair.sheet_db, &pair.sheet_table)
                .db_table(&pair.db_table)
                .key_field(&pair.key_field)
                .poll_interval(Duration::from_secs(interval))
                .field_map(field_map)
                .build()?)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(extra: &str) -> String {
        format!(
            r#"
[postgres]
connection_string = "postgres://localhost/app"

[sheet]
base_url = "https://sheet.example.com/api"
app_token = "token"
{}
"#,
            extra
        )
    }

    fn users_pair() -> &'static str {
        r#"
[[pairs]]
sheet_db = "MyDB"
sheet_table = "users"
db_table = "users"
key_field = "user_key"

[pairs.fields]
"Name" = "name"
"Key" = "user_key"
"#
    }

    #[test]
    fn test_valid_config_converts() {
        let config = ProjectConfig::parse(&base_config(users_pair())).unwrap();
        let pairs = to_pairs(&config).unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].name, "MyDB:users");
        assert_eq!(pairs[0].poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_no_pairs_is_fatal() {
        let config = ProjectConfig::parse(&base_config("")).unwrap();
        assert!(matches!(validate(&config), Err(ConfigError::NoPairs)));
    }

    #[test]
    fn test_window_out_of_range() {
        let extra = format!("[sync]\nwindow_s = 121\n{}", users_pair());
        let config = ProjectConfig::parse(&base_config(&extra)).unwrap();
        assert!(matches!(
            validate(&config),
            Err(ConfigError::InvalidWindow(121))
        ));
    }

    #[test]
    fn test_poll_interval_minimum() {
        let extra = format!("[sync]\npoll_interval_s = 1\n{}", users_pair());
        let config = ProjectConfig::parse(&base_config(&extra)).unwrap();
        assert!(matches!(validate(&config), Err(ConfigError::PollTooShort(1))));
    }

    #[test]
    fn test_batch_size_over_cap() {
        let extra = format!("[sync]\nbatch_size = 500\n{}", users_pair());
        let config = ProjectConfig::parse(&base_config(&extra)).unwrap();
        assert!(matches!(
            validate(&config),
            Err(ConfigError::InvalidBatchSize { size: 500, .. })
        ));
    }

    #[test]
    fn test_unmapped_key_field_is_fatal() {
        let pair = r#"
[[pairs]]
sheet_db = "MyDB"
sheet_table = "users"
db_table = "users"
key_field = "missing"

[pairs.fields]
"Name" = "name"
"#;
        let config = ProjectConfig::parse(&base_config(pair)).unwrap();
        assert!(matches!(
            validate(&config),
            Err(ConfigError::KeyFieldNotMapped { .. })
        ));
    }

    #[test]
    fn test_duplicate_pairs_rejected() {
        let pairs = format!("{}{}", users_pair(), users_pair());
        let config = ProjectConfig::parse(&base_config(&pairs)).unwrap();
        assert!(matches!(
            validate(&config),
            Err(ConfigError::DuplicatePair(_))
        ));
    }

    #[test]
    fn test_error_rate_bounds() {
        let extra = format!("[sync]\npause_on_error_rate = 1.5\n{}", users_pair());
        let config = ProjectConfig::parse(&base_config(&extra)).unwrap();
        assert!(matches!(
            validate(&config),
            Err(ConfigError::InvalidErrorRate(_))
        ));
    }

    #[test]
    fn test_multi_select_must_be_mapped() {
        let pair = r#"
[[pairs]]
sheet_db = "MyDB"
sheet_table = "users"
db_table = "users"
key_field = "user_key"
multi_select = ["tags"]

[pairs.fields]
"Key" = "user_key"
"#;
        let config = ProjectConfig::parse(&base_config(pair)).unwrap();
        assert!(matches!(
            validate(&config),
            Err(ConfigError::MultiSelectNotMapped { .. })
        ));
    }
}
