use rusqlite::Connection;

pub fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tracked_contracts (
            address           TEXT PRIMARY KEY,
            label             TEXT,
            added_at          TEXT NOT NULL,
            transaction_count INTEGER NOT NULL DEFAULT 0,
            last_activity_at  TEXT,
            threat_level      TEXT NOT NULL DEFAULT 'low',
            position          INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS detections (
            id               TEXT PRIMARY KEY,
            contract_address TEXT NOT NULL,
            threat_type      TEXT NOT NULL,
            severity         TEXT NOT NULL,
            confidence       INTEGER NOT NULL,
            tx_hash          TEXT NOT NULL,
            description      TEXT NOT NULL,
            detected_at      TEXT NOT NULL,
            seq              INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_contracts_position ON tracked_contracts(position);
        CREATE INDEX IF NOT EXISTS idx_detections_seq ON detections(seq);
        CREATE INDEX IF NOT EXISTS idx_detections_contract ON detections(contract_address);
        ",
    )?;
    Ok(())
}
