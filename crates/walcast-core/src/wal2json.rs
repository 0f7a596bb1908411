//! Decoder for wal2json (format-version 1) change payloads.
//!
//! One payload describes a whole transaction:
//!
//! ```json
//! {"xid":1234,"change":[
//!   {"kind":"insert","schema":"public","table":"users",
//!    "columnnames":["id","name"],"columntypes":["integer","text"],"columnvalues":[1,"Ann"]},
//!   {"kind":"delete","schema":"public","table":"users",
//!    "oldkeys":{"keynames":["id"],"keytypes":["integer"],"keyvalues":[1]}}
//! ]}
//! ```

use std::collections::HashSet;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::types::{ChangeEvent, ChangeKind, Column, Value};

#[derive(Debug, Deserialize)]
struct Wal2JsonPayload {
    #[serde(default)]
    change: Vec<Wal2JsonChange>,
}

#[derive(Debug, Deserialize)]
struct Wal2JsonChange {
    kind: String,
    #[serde(default)]
    schema: Option<String>,
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    columnnames: Vec<String>,
    #[serde(default)]
    columnvalues: Vec<serde_json::Value>,
    #[serde(default)]
    oldkeys: Option<Wal2JsonOldKeys>,
}

#[derive(Debug, Deserialize)]
struct Wal2JsonOldKeys {
    #[serde(default)]
    keynames: Vec<String>,
    #[serde(default)]
    keyvalues: Vec<serde_json::Value>,
}

/// Decode one wal2json payload into change events.
///
/// Yields exactly one event per entry in `change`, in payload order. A payload
/// with no changes (an empty transaction) yields no events.
pub fn decode_payload(data: &[u8], lsn: u64) -> Result<Vec<ChangeEvent>> {
    let payload: Wal2JsonPayload = serde_json::from_slice(data)?;

    payload
        .change
        .into_iter()
        .map(|change| to_change_event(change, lsn))
        .collect()
}

fn to_change_event(change: Wal2JsonChange, lsn: u64) -> Result<ChangeEvent> {
    let schema = change.schema.unwrap_or_default();
    let table = change.table.unwrap_or_default();

    let columns = zip_columns(&schema, &table, change.columnnames, change.columnvalues)?;
    let identity = match change.oldkeys {
        Some(keys) => zip_columns(&schema, &table, keys.keynames, keys.keyvalues)?,
        None => Vec::new(),
    };

    Ok(ChangeEvent {
        kind: ChangeKind::from_wal2json(&change.kind),
        schema,
        table,
        columns,
        identity,
        lsn,
    })
}

fn zip_columns(
    schema: &str,
    table: &str,
    names: Vec<String>,
    values: Vec<serde_json::Value>,
) -> Result<Vec<Column>> {
    if names.len() != values.len() {
        return Err(Error::Decode(format!(
            "{}.{}: {} column names but {} values",
            schema,
            table,
            names.len(),
            values.len()
        )));
    }

    let mut seen = HashSet::with_capacity(names.len());
    let mut columns = Vec::with_capacity(names.len());

    for (name, value) in names.into_iter().zip(values) {
        if !seen.insert(name.clone()) {
            return Err(Error::DuplicateColumn {
                schema: schema.to_string(),
                table: table.to_string(),
                column: name,
            });
        }
        columns.push(Column::new(name, Value::from(value)));
    }

    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_single_insert() {
        let data = br#"{"change":[{"kind":"insert","schema":"public","table":"users","columnnames":["id","name"],"columnvalues":[1,"Ann"]}]}"#;

        let events = decode_payload(data, 42).unwrap();
        assert_eq!(events.len(), 1);

        let event = &events[0];
        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(event.schema, "public");
        assert_eq!(event.table, "users");
        assert_eq!(
            event.columns,
            vec![
                Column::new("id", Value::Int(1)),
                Column::new("name", Value::String("Ann".into())),
            ]
        );
        assert!(event.identity.is_empty());
        assert_eq!(event.lsn, 42);
    }

    #[test]
    fn test_decode_preserves_change_and_column_order() {
        let data = br#"{"xid":900,"change":[
            {"kind":"insert","schema":"public","table":"a","columnnames":["z","y","x"],"columntypes":["int","int","int"],"columnvalues":[3,2,1]},
            {"kind":"update","schema":"public","table":"b","columnnames":["id","active"],"columnvalues":[7,true],"oldkeys":{"keynames":["id"],"keytypes":["int"],"keyvalues":[7]}},
            {"kind":"delete","schema":"app","table":"c","oldkeys":{"keynames":["id"],"keytypes":["int"],"keyvalues":[9]}}
        ]}"#;

        let events = decode_payload(data, 1).unwrap();
        assert_eq!(events.len(), 3);

        assert_eq!(events[0].table, "a");
        assert_eq!(events[0].column_names().collect::<Vec<_>>(), vec!["z", "y", "x"]);

        assert_eq!(events[1].kind, ChangeKind::Update);
        assert_eq!(events[1].get("active"), Some(&Value::Bool(true)));
        assert_eq!(events[1].get_identity("id"), Some(&Value::Int(7)));

        assert_eq!(events[2].kind, ChangeKind::Delete);
        assert_eq!(events[2].schema, "app");
        assert!(events[2].columns.is_empty());
        assert_eq!(events[2].get_identity("id"), Some(&Value::Int(9)));
    }

    #[test]
    fn test_decode_empty_transaction() {
        assert!(decode_payload(br#"{"change":[]}"#, 1).unwrap().is_empty());
        assert!(decode_payload(br#"{"xid":12}"#, 1).unwrap().is_empty());
    }

    #[test]
    fn test_decode_null_and_nested_values() {
        let data = br#"{"change":[{"kind":"insert","schema":"public","table":"docs","columnnames":["id","body","deleted_at"],"columnvalues":[1,{"title":"x"},null]}]}"#;

        let events = decode_payload(data, 1).unwrap();
        assert!(matches!(events[0].get("body"), Some(Value::Object(_))));
        assert_eq!(events[0].get("deleted_at"), Some(&Value::Null));
    }

    #[test]
    fn test_unknown_kind_maps_to_other() {
        let data = br#"{"change":[{"kind":"message","transactional":false,"prefix":"p","content":"hi"}]}"#;

        let events = decode_payload(data, 1).unwrap();
        assert_eq!(events[0].kind, ChangeKind::Other);
        assert_eq!(events[0].schema, "");
        assert!(events[0].columns.is_empty());
    }

    #[test]
    fn test_malformed_bytes_are_errors() {
        assert!(matches!(decode_payload(b"not json", 1), Err(Error::Json(_))));
        assert!(matches!(decode_payload(b"", 1), Err(Error::Json(_))));
        assert!(decode_payload(br#"{"change":[{"schema":"public"}]}"#, 1).is_err());
    }

    #[test]
    fn test_mismatched_arrays_rejected() {
        let data = br#"{"change":[{"kind":"insert","schema":"public","table":"users","columnnames":["id","name"],"columnvalues":[1]}]}"#;
        assert!(matches!(decode_payload(data, 1), Err(Error::Decode(_))));
    }

    #[test]
    fn test_duplicate_columns_rejected() {
        let data = br#"{"change":[{"kind":"insert","schema":"public","table":"users","columnnames":["id","id"],"columnvalues":[1,2]}]}"#;
        assert!(matches!(
            decode_payload(data, 1),
            Err(Error::DuplicateColumn { ref column, .. }) if column == "id"
        ));
    }
}
