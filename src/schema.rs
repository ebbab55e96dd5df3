//! SQL text for the job table.
//!
//! Table and column names are interpolated double-quoted, so callers must
//! have validated them as identifiers first (see
//! [`QueueConfig::validate`](crate::QueueConfig::validate)).

/// Statements for one table, rendered once per store.
#[derive(Debug, Clone)]
pub(crate) struct Statements {
    pub create: Vec<String>,
    pub drop: String,
    pub select_all: String,
    pub insert_prefix: String,
    pub upsert_suffix: String,
    pub reserve: String,
    pub fetch: String,
    pub complete: String,
    pub fail: String,
    pub recover: String,
    pub mark_stuck: String,
}

impl Statements {
    pub fn new(table: &str, extra_fields: &[String]) -> Self {
        let name = quote(table);
        let index = |suffix: &str| quote(&format!("{table}_{suffix}"));
        let extra_columns: String = extra_fields
            .iter()
            .map(|field| format!(",\n                {} TEXT", quote(field)))
            .collect();
        let extra_names: String = extra_fields
            .iter()
            .map(|field| format!(", {}", quote(field)))
            .collect();

        let create = vec![
            format!(
                r#"
            CREATE TABLE IF NOT EXISTS {name} (
                id BIGSERIAL PRIMARY KEY,
                batch_id BIGINT,
                job_type VARCHAR(200) NOT NULL,
                created_ts TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                started_ts TIMESTAMPTZ,
                body VARCHAR(10000),
                status VARCHAR(100) NOT NULL DEFAULT 'waiting',
                result TEXT,
                recovered BOOLEAN NOT NULL DEFAULT FALSE,
                running_time INTEGER,
                unique_key BIGINT,
                priority BIGINT{extra_columns},
                CONSTRAINT {unique} UNIQUE (unique_key)
            )"#,
                unique = index("unique_key"),
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {name} (created_ts)",
                index("created_ts")
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {name} (status)",
                index("status")
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {name} (job_type, batch_id, status, priority)",
                index("locking_update")
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {name} (batch_id, priority)",
                index("next_jobs_select")
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {name} (started_ts, job_type, status)",
                index("started_ts")
            ),
        ];

        Self {
            create,
            drop: format!("DROP TABLE IF EXISTS {name}"),
            select_all: format!("SELECT * FROM {name} ORDER BY id ASC"),
            insert_prefix: format!(
                "INSERT INTO {name} (body, job_type, unique_key, priority, created_ts{extra_names}) "
            ),
            upsert_suffix: format!(
                " ON CONFLICT (unique_key) DO UPDATE \
                 SET priority = LEAST({name}.priority, EXCLUDED.priority)"
            ),
            // The pick is materialized so its LIMIT is applied once. As an
            // `IN (subquery)` the planner may rerun it per outer row.
            reserve: format!(
                r#"
            WITH picked AS MATERIALIZED (
                SELECT id FROM {name}
                WHERE batch_id IS NULL
                  AND status = 'waiting'
                  AND job_type = $2
                  AND created_ts <= NOW()
                ORDER BY priority ASC, id ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {name} AS claimed
            SET batch_id = $1, status = 'processing', started_ts = NOW()
            FROM picked
            WHERE claimed.id = picked.id"#
            ),
            fetch: format!(
                "SELECT id, body FROM {name} WHERE batch_id = $1 ORDER BY priority ASC, id ASC LIMIT $2"
            ),
            complete: outcome_update(&name, "success"),
            fail: outcome_update(&name, "error"),
            recover: format!(
                r#"
            UPDATE {name}
            SET status = 'waiting', batch_id = NULL, started_ts = NULL, recovered = TRUE
            WHERE status = 'processing'
              AND started_ts < NOW() - make_interval(secs => $1)
              AND job_type = $2"#
            ),
            mark_stuck: format!(
                r#"
            UPDATE {name}
            SET status = 'stuck', unique_key = NULL, recovered = TRUE
            WHERE status = 'processing'
              AND started_ts < NOW() - make_interval(secs => $1)
              AND job_type = $2"#
            ),
        }
    }
}

/// Double-quotes an already validated identifier, so reserved words and
/// mixed case survive as written.
fn quote(identifier: &str) -> String {
    format!("\"{identifier}\"")
}

fn outcome_update(name: &str, status: &str) -> String {
    format!(
        r#"
            UPDATE {name}
            SET result = $1,
                unique_key = NULL,
                status = '{status}',
                running_time = EXTRACT(EPOCH FROM (NOW() - started_ts))::INTEGER
            WHERE id = $2
              AND batch_id = $3
              AND status = 'processing'"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extra_fields_become_text_columns() {
        let statements = Statements::new("jobs", &["user_id".to_string(), "shard".to_string()]);

        assert!(statements.create[0].contains(r#""user_id" TEXT"#));
        assert!(statements.create[0].contains(r#""shard" TEXT"#));
        assert!(statements
            .insert_prefix
            .ends_with(r#"created_ts, "user_id", "shard") "#));
    }

    #[test]
    fn identifiers_are_quoted_verbatim() {
        let statements = Statements::new("Jobs", &["userId".to_string(), "user".to_string()]);

        assert!(statements.create[0].contains(r#"CREATE TABLE IF NOT EXISTS "Jobs" ("#));
        assert!(statements.create[0].contains(r#""userId" TEXT"#));
        assert!(statements.create[0].contains(r#""user" TEXT"#));
        assert!(statements.create[0].contains(r#"CONSTRAINT "Jobs_unique_key" UNIQUE"#));
        assert!(statements.create[3].contains(r#""Jobs_locking_update" ON "Jobs""#));
        assert!(statements.upsert_suffix.contains(r#"LEAST("Jobs".priority"#));
    }

    #[test]
    fn reserve_limits_the_pick_before_updating() {
        let statements = Statements::new("jobs", &[]);
        let reserve = &statements.reserve;

        assert!(reserve.contains("WITH picked AS MATERIALIZED"));
        assert!(reserve.contains("FROM picked"));
        assert!(!reserve.contains(" IN ("));
        let limit = reserve.find("LIMIT $3").unwrap();
        let lock = reserve.find("FOR UPDATE SKIP LOCKED").unwrap();
        let update = reserve.find(r#"UPDATE "jobs""#).unwrap();
        assert!(limit < lock && lock < update);
    }

    #[test]
    fn every_statement_targets_the_table() {
        let statements = Statements::new("nightly_jobs", &[]);
        for sql in statements.create.iter().chain([
            &statements.reserve,
            &statements.fetch,
            &statements.complete,
            &statements.fail,
            &statements.recover,
            &statements.mark_stuck,
        ]) {
            assert!(sql.contains("nightly_jobs"), "{sql}");
        }
        assert!(statements.complete.contains("status = 'success'"));
        assert!(statements.fail.contains("status = 'error'"));
    }
}
