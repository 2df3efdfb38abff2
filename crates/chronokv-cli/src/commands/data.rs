use anyhow::{Context, Result, bail};
use chronokv_core::store::{Mutation, Store, Timestamp};
use clap::Args;
use serde_json::json;
use tracing::debug;

use super::OutputContext;

#[derive(Args)]
pub struct GetArgs {
    /// Table name
    pub table: String,
    /// Key
    pub key: String,
}

#[derive(Args)]
pub struct PutArgs {
    /// Table name
    pub table: String,
    /// Key
    pub key: String,
    /// Value
    pub value: String,
}

#[derive(Args)]
pub struct DelArgs {
    /// Table name
    pub table: String,
    /// Key
    pub key: String,
}

#[derive(Args)]
pub struct ScanArgs {
    /// Table name
    pub table: String,
    /// Start at this key instead of the first (or last, with --reverse)
    #[arg(long)]
    pub from: Option<String>,
    /// Walk keys in descending order
    #[arg(short, long)]
    pub reverse: bool,
    /// Stop after this many keys
    #[arg(short, long)]
    pub limit: Option<usize>,
}

#[derive(Args)]
pub struct LogArgs {
    /// Only show mutations after this timestamp (hex)
    #[arg(long)]
    pub after: Option<String>,
    /// Maximum number of mutations
    #[arg(short, long, default_value_t = 100)]
    pub limit: usize,
}

/// One live key found by a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub timestamp: Timestamp,
}

pub fn get(store: &Store, args: GetArgs, output: &OutputContext) -> Result<()> {
    let key = output.input(&args.key)?;
    let txn = store.read_txn()?;
    let value = store.get(&txn, args.table.as_bytes(), &key)?;
    let version = store.version(&txn, args.table.as_bytes(), &key)?;

    if output.json {
        return output.print_json(&json!({
            "table": args.table,
            "key": args.key,
            "value": value.map(|v| output.render(v)),
            "timestamp": version.map(|ts| ts.to_string()),
        }));
    }

    match value {
        Some(value) => {
            println!("{}", output.render(value));
            Ok(())
        }
        None => bail!("key `{}` not found in table `{}`", args.key, args.table),
    }
}

pub fn put(store: &Store, args: PutArgs, output: &OutputContext) -> Result<()> {
    let key = output.input(&args.key)?;
    let value = output.input(&args.value)?;

    let mut txn = store.write_txn()?;
    let ts = store.put(&mut txn, args.table.as_bytes(), &key, &value)?;
    txn.commit()?;
    debug!(table = %args.table, %ts, len = value.len(), "put committed");

    if output.json {
        return output.print_json(&json!({ "timestamp": ts.to_string() }));
    }
    output.print_success(&format!("{}/{} written at {ts}", args.table, args.key));
    Ok(())
}

pub fn del(store: &Store, args: DelArgs, output: &OutputContext) -> Result<()> {
    let key = output.input(&args.key)?;

    let mut txn = store.write_txn()?;
    let deleted = store.del(&mut txn, args.table.as_bytes(), &key)?;
    txn.commit()?;
    debug!(table = %args.table, deleted = deleted.is_some(), "del committed");

    if output.json {
        return output.print_json(&json!({
            "deleted": deleted.is_some(),
            "timestamp": deleted.map(|ts| ts.to_string()),
        }));
    }
    match deleted {
        Some(ts) => output.print_success(&format!("{}/{} deleted at {ts}", args.table, args.key)),
        None => output.print_info(&format!("{}/{} has no live value", args.table, args.key)),
    }
    Ok(())
}

pub fn scan(store: &Store, args: ScanArgs, output: &OutputContext) -> Result<()> {
    let from = args.from.as_deref().map(|k| output.input(k)).transpose()?;
    let entries = scan_entries(
        store,
        args.table.as_bytes(),
        from.as_deref(),
        args.reverse,
        args.limit.unwrap_or(usize::MAX),
    )?;

    if output.json {
        let rows: Vec<_> = entries
            .iter()
            .map(|e| {
                json!({
                    "key": output.render(&e.key),
                    "value": output.render(&e.value),
                    "timestamp": e.timestamp.to_string(),
                })
            })
            .collect();
        return output.print_json(&json!(rows));
    }

    let rows: Vec<Vec<String>> = entries
        .iter()
        .map(|e| vec![output.render(&e.key), output.render(&e.value), e.timestamp.to_string()])
        .collect();
    output.print_table(&["key", "value", "timestamp"], &rows);
    Ok(())
}

/// Collect live keys of `table` in cursor order
///
/// With `from`, forward scans start at the first key `>= from` and reverse
/// scans at the last key `<= from`.
pub fn scan_entries(
    store: &Store,
    table: &[u8],
    from: Option<&[u8]>,
    reverse: bool,
    limit: usize,
) -> Result<Vec<Entry>> {
    let txn = store.read_txn()?;
    let mut cursor = store.cursor(&txn, table)?;

    let mut more = match (from, reverse) {
        (None, false) => cursor.first()?,
        (None, true) => cursor.last()?,
        (Some(key), false) => cursor.seek(key)?,
        (Some(key), true) => {
            if cursor.seek(key)? {
                let exact = cursor.get()?.is_some_and(|(k, _)| k == key);
                exact || cursor.prev()?
            } else {
                cursor.last()?
            }
        }
    };

    let mut entries = Vec::new();
    while more && entries.len() < limit {
        if let (Some((key, value)), Some(timestamp)) = (cursor.get()?, cursor.timestamp()) {
            entries.push(Entry {
                key: key.to_vec(),
                value: value.to_vec(),
                timestamp,
            });
        }
        more = if reverse { cursor.prev()? } else { cursor.next()? };
    }
    Ok(entries)
}

pub fn log(store: &Store, args: LogArgs, output: &OutputContext) -> Result<()> {
    let after = args.after.as_deref().map(parse_timestamp).transpose()?;
    let txn = store.read_txn()?;
    let mutations = store.log_range(&txn, after.as_ref(), args.limit)?;

    if output.json {
        let rows: Vec<_> = mutations.iter().map(|m| mutation_json(m, output)).collect();
        return output.print_json(&json!(rows));
    }

    let rows: Vec<Vec<String>> = mutations
        .iter()
        .map(|m| {
            vec![
                m.timestamp().to_string(),
                op_name(m).to_owned(),
                String::from_utf8_lossy(m.key().table()).into_owned(),
                output.render(m.key().key()),
                m.value().map(|v| output.render(v)).unwrap_or_default(),
            ]
        })
        .collect();
    output.print_table(&["timestamp", "op", "table", "key", "value"], &rows);
    Ok(())
}

/// Parse a timestamp printed by `log` or `put`
pub fn parse_timestamp(text: &str) -> Result<Timestamp> {
    let bytes = hex::decode(text).with_context(|| format!("`{text}` is not a hex timestamp"))?;
    Ok(Timestamp::from_slice(&bytes)?)
}

fn op_name(mutation: &Mutation) -> &'static str {
    if mutation.is_put() { "put" } else { "del" }
}

fn mutation_json(mutation: &Mutation, output: &OutputContext) -> serde_json::Value {
    json!({
        "timestamp": mutation.timestamp().to_string(),
        "op": op_name(mutation),
        "table": String::from_utf8_lossy(mutation.key().table()),
        "key": output.render(mutation.key().key()),
        "value": mutation.value().map(|v| output.render(v)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronokv_core::testing::TestContext;

    fn seed(store: &Store) {
        let mut txn = store.write_txn().unwrap();
        for key in ["a", "b", "c", "d"] {
            store.put(&mut txn, b"t", key.as_bytes(), key.to_uppercase().as_bytes()).unwrap();
        }
        store.del(&mut txn, b"t", b"c").unwrap();
        store.put(&mut txn, b"other", b"a", b"x").unwrap();
        txn.commit().unwrap();
    }

    fn keys(entries: &[Entry]) -> Vec<String> {
        entries
            .iter()
            .map(|e| String::from_utf8_lossy(&e.key).into_owned())
            .collect()
    }

    #[test]
    fn test_scan_skips_tombstones_both_ways() {
        let ctx = TestContext::new();
        let store = ctx.open_store("scan");
        seed(&store);

        let forward = scan_entries(&store, b"t", None, false, usize::MAX).unwrap();
        assert_eq!(keys(&forward), vec!["a", "b", "d"]);
        assert_eq!(forward[0].value, b"A");

        let backward = scan_entries(&store, b"t", None, true, usize::MAX).unwrap();
        assert_eq!(keys(&backward), vec!["d", "b", "a"]);
    }

    #[test]
    fn test_scan_from_and_limit() {
        let ctx = TestContext::new();
        let store = ctx.open_store("scan");
        seed(&store);

        let from_c = scan_entries(&store, b"t", Some(b"c"), false, usize::MAX).unwrap();
        assert_eq!(keys(&from_c), vec!["d"]);

        let down_from_c = scan_entries(&store, b"t", Some(b"c"), true, usize::MAX).unwrap();
        assert_eq!(keys(&down_from_c), vec!["b", "a"]);

        let down_from_b = scan_entries(&store, b"t", Some(b"b"), true, 1).unwrap();
        assert_eq!(keys(&down_from_b), vec!["b"]);

        let down_from_z = scan_entries(&store, b"t", Some(b"z"), true, usize::MAX).unwrap();
        assert_eq!(keys(&down_from_z), vec!["d", "b", "a"]);

        let down_from_0 = scan_entries(&store, b"t", Some(b"0"), true, usize::MAX).unwrap();
        assert!(down_from_0.is_empty());
    }

    #[test]
    fn test_scan_unknown_table_is_empty() {
        let ctx = TestContext::new();
        let store = ctx.open_store("scan");
        seed(&store);
        assert!(scan_entries(&store, b"missing", None, false, usize::MAX).unwrap().is_empty());
    }

    #[test]
    fn test_put_get_del_commands() {
        let ctx = TestContext::new();
        let store = ctx.open_store("cmds");
        let output = OutputContext::default();

        put(
            &store,
            PutArgs {
                table: "users".into(),
                key: "alice".into(),
                value: "admin".into(),
            },
            &output,
        )
        .unwrap();
        get(
            &store,
            GetArgs {
                table: "users".into(),
                key: "alice".into(),
            },
            &output,
        )
        .unwrap();

        del(
            &store,
            DelArgs {
                table: "users".into(),
                key: "alice".into(),
            },
            &output,
        )
        .unwrap();
        let missing = get(
            &store,
            GetArgs {
                table: "users".into(),
                key: "alice".into(),
            },
            &output,
        );
        assert!(missing.is_err());

        let txn = store.read_txn().unwrap();
        assert_eq!(store.log_len(&txn).unwrap(), 2);
    }

    #[derive(Clone, Default)]
    struct Captured(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_put_emits_debug_event() {
        let ctx = TestContext::new();
        let store = ctx.open_store("traced");
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            put(
                &store,
                PutArgs {
                    table: "users".into(),
                    key: "alice".into(),
                    value: "admin".into(),
                },
                &OutputContext::default(),
            )
            .unwrap();
        });

        let logs = String::from_utf8_lossy(&captured.0.lock().unwrap()).into_owned();
        assert!(logs.contains("put committed"));
        assert!(logs.contains("users"));
    }

    #[test]
    fn test_parse_timestamp_round_trips_display() {
        let ts = Timestamp::new(7, 8, 9, 11);
        assert_eq!(parse_timestamp(&ts.to_string()).unwrap(), ts);
        assert!(parse_timestamp("abcd").is_err());
        assert!(parse_timestamp("not hex").is_err());
    }

    #[test]
    fn test_log_after_timestamp() {
        let ctx = TestContext::new();
        let store = ctx.open_store("log");
        seed(&store);

        let txn = store.read_txn().unwrap();
        let all = store.log_range(&txn, None, usize::MAX).unwrap();
        assert_eq!(all.len(), 6);
        let after = parse_timestamp(&all[3].timestamp().to_string()).unwrap();
        let rest = store.log_range(&txn, Some(&after), usize::MAX).unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(op_name(&rest[0]), "del");
    }
}
