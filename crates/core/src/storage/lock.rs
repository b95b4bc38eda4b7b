use anyhow::Context;
use sqlx::pool::PoolConnection;
use sqlx::Postgres;

// Advisory locks are scoped to the Postgres session, so the acquiring connection is held until
// release and the unlock runs on that same connection.
const LOCK_NAMESPACE: i64 = 0x5354_4B56_414C; // "STKVAL"

pub fn lock_key_for_symbol(symbol: &str) -> i64 {
    // FNV-1a: stable across processes and builds, unlike std's hasher.
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in symbol.as_bytes() {
        h ^= u64::from(*b);
        h = h.wrapping_mul(0x0100_0000_01b3);
    }
    LOCK_NAMESPACE ^ (h as i64)
}

pub async fn try_acquire_symbol_lock(
    pool: &sqlx::PgPool,
    symbol: &str,
) -> anyhow::Result<Option<PoolConnection<Postgres>>> {
    let key = lock_key_for_symbol(symbol);
    let mut conn = pool
        .acquire()
        .await
        .context("failed to acquire connection for advisory lock")?;

    let acquired: (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
        .persistent(false)
        .bind(key)
        .fetch_one(&mut *conn)
        .await
        .with_context(|| format!("failed to acquire advisory lock (key={key})"))?;

    Ok(acquired.0.then_some(conn))
}

pub async fn release_symbol_lock(
    mut conn: PoolConnection<Postgres>,
    symbol: &str,
) -> anyhow::Result<()> {
    let key = lock_key_for_symbol(symbol);
    sqlx::query("SELECT pg_advisory_unlock($1)")
        .persistent(false)
        .bind(key)
        .execute(&mut *conn)
        .await
        .with_context(|| format!("failed to release advisory lock (key={key})"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_keys_are_stable_and_distinct() {
        assert_eq!(lock_key_for_symbol("AAPL"), lock_key_for_symbol("AAPL"));
        assert_ne!(lock_key_for_symbol("AAPL"), lock_key_for_symbol("MSFT"));
        assert_ne!(lock_key_for_symbol(""), lock_key_for_symbol("A"));
    }
}
