//! Row-level repositories over the store schema.
//!
//! Every function takes a plain [`Connection`] so it can run either inside
//! an engine transaction (rusqlite's `Transaction` derefs to `Connection`)
//! or standalone for reads.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use uuid::Uuid;

use bullion_core::{
    Account, Asset, CashTransaction, EntryDetails, LedgerEntry, LpPosition, Order, OrderStatus,
    TransactionStatus,
};

use crate::{
    date_col, date_col_opt, decimal_col, decimal_col_opt, invalid_column, parsed_col, uuid_col,
    StoreError, StoreResult,
};

/// Strip the messaging-channel prefix and every non-digit character.
#[must_use]
pub fn normalize_phone(raw: &str) -> String {
    raw.trim()
        .trim_start_matches("whatsapp:")
        .chars()
        .filter(char::is_ascii_digit)
        .collect()
}

/// Whether two phone numbers identify the same subscriber under the
/// accepted normalizations (with or without a country prefix).
#[must_use]
pub fn phones_match(left: &str, right: &str) -> bool {
    let left = normalize_phone(left);
    let right = normalize_phone(right);
    if left.is_empty() || right.is_empty() {
        return false;
    }
    if left == right {
        return true;
    }
    // A country prefix on one side only: compare national significant digits.
    if left.len() >= 9 && right.len() >= 9 {
        return left[left.len() - 9..] == right[right.len() - 9..];
    }
    false
}

pub mod admins {
    use super::*;

    pub fn insert(
        conn: &Connection,
        id: Uuid,
        name: &str,
        email: &str,
        created_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        conn.execute(
            "INSERT INTO admins (id, name, email, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id.to_string(), name, email, created_at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn exists(conn: &Connection, id: Uuid) -> StoreResult<bool> {
        let found: Option<String> = conn
            .query_row(
                "SELECT id FROM admins WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

pub mod accounts {
    use super::*;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
        Ok(Account {
            id: uuid_col(row, 0)?,
            ref_mid: row.get(1)?,
            account_head: row.get(2)?,
            accode: row.get(3)?,
            account_type: row.get(4)?,
            cash_balance: decimal_col(row, 5)?,
            metal_weight: decimal_col(row, 6)?,
            margin_pct: decimal_col(row, 7)?,
            ask_spread: decimal_col(row, 8)?,
            bid_spread: decimal_col(row, 9)?,
            admin_owner: uuid_col(row, 10)?,
            phone_number: row.get(11)?,
            email: row.get(12)?,
            status: serde_plain_parse(row, 13)?,
            kyc_status: serde_plain_parse(row, 14)?,
            created_at: date_col(row, 15)?,
        })
    }

    // Account/KYC statuses serialize lowercase; go through serde_json for
    // the round trip instead of hand-rolled FromStr impls.
    fn serde_plain_parse<T: serde::de::DeserializeOwned>(
        row: &Row<'_>,
        index: usize,
    ) -> rusqlite::Result<T> {
        let raw: String = row.get(index)?;
        serde_json::from_value(serde_json::Value::String(raw))
            .map_err(|err| invalid_column(index, err))
    }

    fn status_string<T: serde::Serialize>(value: &T) -> String {
        match serde_json::to_value(value) {
            Ok(serde_json::Value::String(text)) => text,
            _ => String::new(),
        }
    }

    const COLUMNS: &str = "id, ref_mid, account_head, accode, account_type, cash_balance, \
         metal_weight, margin_pct, ask_spread, bid_spread, admin_owner, phone_number, email, \
         status, kyc_status, created_at";

    pub fn insert(conn: &Connection, account: &Account) -> StoreResult<()> {
        conn.execute(
            "INSERT INTO accounts (id, ref_mid, account_head, accode, account_type, cash_balance, \
             metal_weight, margin_pct, ask_spread, bid_spread, admin_owner, phone_number, email, \
             status, kyc_status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                account.id.to_string(),
                account.ref_mid,
                account.account_head,
                account.accode,
                account.account_type,
                account.cash_balance.to_string(),
                account.metal_weight.to_string(),
                account.margin_pct.to_string(),
                account.ask_spread.to_string(),
                account.bid_spread.to_string(),
                account.admin_owner.to_string(),
                account.phone_number,
                account.email,
                status_string(&account.status),
                status_string(&account.kyc_status),
                account.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn by_id(conn: &Connection, id: Uuid) -> StoreResult<Account> {
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM accounts WHERE id = ?1"),
            params![id.to_string()],
            from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("account {id}")))
    }

    /// Admin-scoped read; cross-admin access reports NotFound.
    pub fn by_id_for_admin(conn: &Connection, id: Uuid, admin_id: Uuid) -> StoreResult<Account> {
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM accounts WHERE id = ?1 AND admin_owner = ?2"),
            params![id.to_string(), admin_id.to_string()],
            from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("account {id}")))
    }

    pub fn list_for_admin(conn: &Connection, admin_id: Uuid) -> StoreResult<Vec<Account>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM accounts WHERE admin_owner = ?1 ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map(params![admin_id.to_string()], from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Find the account owning a phone number under the accepted
    /// normalizations.
    pub fn by_phone(conn: &Connection, raw_phone: &str) -> StoreResult<Option<Account>> {
        let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM accounts"))?;
        let rows = stmt.query_map([], from_row)?;
        for account in rows {
            let account = account?;
            if super::phones_match(&account.phone_number, raw_phone) {
                return Ok(Some(account));
            }
        }
        Ok(None)
    }

    /// Overwrite the cash/metal balances. Only the engine calls this, and
    /// only inside one of its transactions.
    pub fn update_balances(
        conn: &Connection,
        id: Uuid,
        cash_balance: Decimal,
        metal_weight: Decimal,
    ) -> StoreResult<()> {
        let updated = conn.execute(
            "UPDATE accounts SET cash_balance = ?2, metal_weight = ?3 WHERE id = ?1",
            params![
                id.to_string(),
                cash_balance.to_string(),
                metal_weight.to_string()
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("account {id}")));
        }
        Ok(())
    }
}

pub mod orders {
    use super::*;

    const COLUMNS: &str = "id, order_no, side, volume, symbol, price, opening_price, \
         closing_price, required_margin, opening_date, closing_date, status, profit, user, \
         admin_id, lp_position_id, ticket, comment, notification_error";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Order> {
        Ok(Order {
            id: uuid_col(row, 0)?,
            order_no: row.get(1)?,
            side: parsed_col(row, 2)?,
            volume: decimal_col(row, 3)?,
            symbol: row.get(4)?,
            price: decimal_col(row, 5)?,
            opening_price: decimal_col(row, 6)?,
            closing_price: decimal_col_opt(row, 7)?,
            required_margin: decimal_col(row, 8)?,
            opening_date: date_col(row, 9)?,
            closing_date: date_col_opt(row, 10)?,
            status: parsed_col(row, 11)?,
            profit: decimal_col(row, 12)?,
            user: uuid_col(row, 13)?,
            admin_id: uuid_col(row, 14)?,
            lp_position_id: row.get(15)?,
            ticket: row.get::<_, Option<i64>>(16)?.map(|t| t as u64),
            comment: row.get(17)?,
            notification_error: row.get(18)?,
        })
    }

    pub fn insert(conn: &Connection, order: &Order) -> StoreResult<()> {
        conn.execute(
            "INSERT INTO orders (id, order_no, side, volume, symbol, price, opening_price, \
             closing_price, required_margin, opening_date, closing_date, status, profit, user, \
             admin_id, lp_position_id, ticket, comment, notification_error) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, \
             ?18, ?19)",
            params![
                order.id.to_string(),
                order.order_no,
                order.side.to_string(),
                order.volume.to_string(),
                order.symbol,
                order.price.to_string(),
                order.opening_price.to_string(),
                order.closing_price.map(|p| p.to_string()),
                order.required_margin.to_string(),
                order.opening_date.to_rfc3339(),
                order.closing_date.map(|d| d.to_rfc3339()),
                order.status.to_string(),
                order.profit.to_string(),
                order.user.to_string(),
                order.admin_id.to_string(),
                order.lp_position_id,
                order.ticket.map(|t| t as i64),
                order.comment,
                order.notification_error,
            ],
        )?;
        Ok(())
    }

    /// Rewrite every mutable field of an existing order.
    pub fn update(conn: &Connection, order: &Order) -> StoreResult<()> {
        let updated = conn.execute(
            "UPDATE orders SET price = ?2, closing_price = ?3, closing_date = ?4, status = ?5, \
             profit = ?6, lp_position_id = ?7, ticket = ?8, comment = ?9, \
             notification_error = ?10, required_margin = ?11 WHERE id = ?1",
            params![
                order.id.to_string(),
                order.price.to_string(),
                order.closing_price.map(|p| p.to_string()),
                order.closing_date.map(|d| d.to_rfc3339()),
                order.status.to_string(),
                order.profit.to_string(),
                order.lp_position_id,
                order.ticket.map(|t| t as i64),
                order.comment,
                order.notification_error,
                order.required_margin.to_string(),
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("order {}", order.id)));
        }
        Ok(())
    }

    /// Admin-scoped read; cross-admin access reports NotFound.
    pub fn by_id_for_admin(conn: &Connection, id: Uuid, admin_id: Uuid) -> StoreResult<Order> {
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM orders WHERE id = ?1 AND admin_id = ?2"),
            params![id.to_string(), admin_id.to_string()],
            from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("order {id}")))
    }

    pub fn by_order_no(conn: &Connection, order_no: &str) -> StoreResult<Order> {
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM orders WHERE order_no = ?1"),
            params![order_no],
            from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("order {order_no}")))
    }

    pub fn list_for_admin(conn: &Connection, admin_id: Uuid) -> StoreResult<Vec<Order>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM orders WHERE admin_id = ?1 ORDER BY opening_date DESC"
        ))?;
        let rows = stmt.query_map(params![admin_id.to_string()], from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Orders still carrying open exposure for a user.
    pub fn processing_for_user(conn: &Connection, user: Uuid) -> StoreResult<Vec<Order>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM orders WHERE user = ?1 AND status = ?2 \
             ORDER BY opening_date ASC"
        ))?;
        let rows = stmt.query_map(
            params![user.to_string(), OrderStatus::Processing.to_string()],
            from_row,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

pub mod lp_positions {
    use super::*;

    const COLUMNS: &str = "position_id, side, volume, symbol, entry_price, current_price, \
         closing_price, open_date, close_date, status, profit, client_order, admin_id";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<LpPosition> {
        Ok(LpPosition {
            position_id: row.get(0)?,
            side: parsed_col(row, 1)?,
            volume: decimal_col(row, 2)?,
            symbol: row.get(3)?,
            entry_price: decimal_col(row, 4)?,
            current_price: decimal_col(row, 5)?,
            closing_price: decimal_col_opt(row, 6)?,
            open_date: date_col(row, 7)?,
            close_date: date_col_opt(row, 8)?,
            status: parsed_col(row, 9)?,
            profit: decimal_col(row, 10)?,
            client_order: uuid_col(row, 11)?,
            admin_id: uuid_col(row, 12)?,
        })
    }

    pub fn insert(conn: &Connection, position: &LpPosition) -> StoreResult<()> {
        conn.execute(
            "INSERT INTO lp_positions (position_id, side, volume, symbol, entry_price, \
             current_price, closing_price, open_date, close_date, status, profit, client_order, \
             admin_id) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                position.position_id,
                position.side.to_string(),
                position.volume.to_string(),
                position.symbol,
                position.entry_price.to_string(),
                position.current_price.to_string(),
                position.closing_price.map(|p| p.to_string()),
                position.open_date.to_rfc3339(),
                position.close_date.map(|d| d.to_rfc3339()),
                position.status.to_string(),
                position.profit.to_string(),
                position.client_order.to_string(),
                position.admin_id.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn by_position_id(conn: &Connection, position_id: &str) -> StoreResult<LpPosition> {
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM lp_positions WHERE position_id = ?1"),
            params![position_id],
            from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("lp position {position_id}")))
    }

    pub fn update(conn: &Connection, position: &LpPosition) -> StoreResult<()> {
        let updated = conn.execute(
            "UPDATE lp_positions SET current_price = ?2, closing_price = ?3, close_date = ?4, \
             status = ?5, profit = ?6 WHERE position_id = ?1",
            params![
                position.position_id,
                position.current_price.to_string(),
                position.closing_price.map(|p| p.to_string()),
                position.close_date.map(|d| d.to_rfc3339()),
                position.status.to_string(),
                position.profit.to_string(),
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!(
                "lp position {}",
                position.position_id
            )));
        }
        Ok(())
    }
}

pub mod ledger {
    use super::*;

    const COLUMNS: &str = "entry_id, kind, nature, reference_number, amount, running_balance, \
         date, user, admin_id, asset, details, description, notes";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
        let details_raw: String = row.get(10)?;
        let details: EntryDetails =
            serde_json::from_str(&details_raw).map_err(|err| invalid_column(10, err))?;
        Ok(LedgerEntry {
            entry_id: row.get(0)?,
            kind: parsed_col(row, 1)?,
            nature: parsed_col(row, 2)?,
            reference_number: row.get(3)?,
            amount: decimal_col(row, 4)?,
            running_balance: decimal_col(row, 5)?,
            date: date_col(row, 6)?,
            user: uuid_col(row, 7)?,
            admin_id: uuid_col(row, 8)?,
            details,
            description: row.get(11)?,
            notes: row.get(12)?,
        })
    }

    /// Append one immutable journal line.
    pub fn append(conn: &Connection, entry: &LedgerEntry) -> StoreResult<()> {
        let asset = match &entry.details {
            EntryDetails::Transaction { asset, .. } => Some(asset.to_string()),
            _ => None,
        };
        let details = serde_json::to_string(&entry.details)
            .map_err(|err| StoreError::Database(err.to_string()))?;
        conn.execute(
            "INSERT INTO ledger (entry_id, kind, nature, reference_number, amount, \
             running_balance, date, user, admin_id, asset, details, description, notes) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                entry.entry_id,
                entry.kind.to_string(),
                entry.nature.to_string(),
                entry.reference_number,
                entry.amount.to_string(),
                entry.running_balance.to_string(),
                entry.date.to_rfc3339(),
                entry.user.to_string(),
                entry.admin_id.to_string(),
                asset,
                details,
                entry.description,
                entry.notes,
            ],
        )?;
        Ok(())
    }

    /// Statement page for a user, newest first.
    pub fn list_for_user(
        conn: &Connection,
        user: Uuid,
        limit: u32,
        offset: u32,
    ) -> StoreResult<Vec<LedgerEntry>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM ledger WHERE user = ?1 ORDER BY date DESC, entry_id DESC \
             LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt.query_map(params![user.to_string(), limit, offset], from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn by_reference(conn: &Connection, reference: &str) -> StoreResult<Vec<LedgerEntry>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM ledger WHERE reference_number = ?1 ORDER BY rowid ASC"
        ))?;
        let rows = stmt.query_map(params![reference], from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Signed sum of TRANSACTION entries for one `(user, asset)` pair. Under
    /// ledger conservation this equals the live account balance.
    pub fn signed_sum(conn: &Connection, user: Uuid, asset: Asset) -> StoreResult<Decimal> {
        let mut stmt = conn.prepare(
            "SELECT nature, amount FROM ledger WHERE user = ?1 AND asset = ?2",
        )?;
        let rows = stmt.query_map(params![user.to_string(), asset.to_string()], |row| {
            let nature: String = row.get(0)?;
            let amount: String = row.get(1)?;
            Ok((nature, amount))
        })?;
        let mut total = Decimal::ZERO;
        for row in rows {
            let (nature, amount) = row?;
            let nature: bullion_core::EntryNature = nature
                .parse()
                .map_err(|err: String| StoreError::Database(err))?;
            let amount: Decimal = amount
                .parse()
                .map_err(|err| StoreError::Database(format!("bad ledger amount: {err}")))?;
            total += nature.sign() * amount;
        }
        Ok(total)
    }
}

pub mod transactions {
    use super::*;

    const COLUMNS: &str = "transaction_id, kind, asset, amount, user, admin_id, \
         previous_balance, new_balance, status, created_at";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<CashTransaction> {
        Ok(CashTransaction {
            transaction_id: row.get(0)?,
            kind: parsed_col(row, 1)?,
            asset: parsed_col(row, 2)?,
            amount: decimal_col(row, 3)?,
            user: uuid_col(row, 4)?,
            admin_id: uuid_col(row, 5)?,
            previous_balance: decimal_col(row, 6)?,
            new_balance: decimal_col(row, 7)?,
            status: parsed_col(row, 8)?,
            created_at: date_col(row, 9)?,
        })
    }

    pub fn insert(conn: &Connection, tx_record: &CashTransaction) -> StoreResult<()> {
        conn.execute(
            "INSERT INTO transactions (transaction_id, kind, asset, amount, user, admin_id, \
             previous_balance, new_balance, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                tx_record.transaction_id,
                tx_record.kind.to_string(),
                tx_record.asset.to_string(),
                tx_record.amount.to_string(),
                tx_record.user.to_string(),
                tx_record.admin_id.to_string(),
                tx_record.previous_balance.to_string(),
                tx_record.new_balance.to_string(),
                tx_record.status.to_string(),
                tx_record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn by_id(conn: &Connection, transaction_id: &str) -> StoreResult<CashTransaction> {
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM transactions WHERE transaction_id = ?1"),
            params![transaction_id],
            from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("transaction {transaction_id}")))
    }

    pub fn update_status(
        conn: &Connection,
        transaction_id: &str,
        status: TransactionStatus,
    ) -> StoreResult<()> {
        let updated = conn.execute(
            "UPDATE transactions SET status = ?2 WHERE transaction_id = ?1",
            params![transaction_id, status.to_string()],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!(
                "transaction {transaction_id}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;
    use bullion_core::{
        AccountStatus, EntryKind, EntryNature, KycStatus, Side, TransactionKind,
    };
    use rust_decimal_macros::dec;

    fn sample_account(admin: Uuid) -> Account {
        Account {
            id: Uuid::new_v4(),
            ref_mid: "10234".into(),
            account_head: "Al Noor Jewellery".into(),
            accode: "ANJ-01".into(),
            account_type: "trading".into(),
            cash_balance: dec!(10000),
            metal_weight: dec!(0),
            margin_pct: dec!(20),
            ask_spread: dec!(0.5),
            bid_spread: dec!(0.5),
            admin_owner: admin,
            phone_number: "+971 50 123 4567".into(),
            email: None,
            status: AccountStatus::Active,
            kyc_status: KycStatus::Verified,
            created_at: Utc::now(),
        }
    }

    fn sample_order(user: Uuid, admin: Uuid) -> Order {
        Order {
            id: Uuid::new_v4(),
            order_no: bullion_core::identifiers::next_order_no(),
            side: Side::Buy,
            volume: dec!(0.01),
            symbol: "GOLD".into(),
            price: dec!(1902.5),
            opening_price: dec!(1902.5),
            closing_price: None,
            required_margin: dec!(19.025),
            opening_date: Utc::now(),
            closing_date: None,
            status: OrderStatus::Processing,
            profit: dec!(0),
            user,
            admin_id: admin,
            lp_position_id: None,
            ticket: Some(12345),
            comment: None,
            notification_error: None,
        }
    }

    #[test]
    fn phone_normalizations_match() {
        assert!(phones_match("whatsapp:+971501234567", "971 50 123 4567"));
        assert!(phones_match("(971) 50-123-4567", "0501234567"));
        assert!(phones_match("501234567", "+971501234567"));
        assert!(!phones_match("971501234567", "971509999999"));
        assert!(!phones_match("", "971501234567"));
    }

    #[test]
    fn account_round_trips_and_scopes_by_admin() {
        let store = Store::open_in_memory().unwrap();
        let admin = Uuid::new_v4();
        let other_admin = Uuid::new_v4();
        let account = sample_account(admin);

        store
            .with_tx(|tx| accounts::insert(tx, &account))
            .unwrap();
        let loaded = store
            .with_conn(|conn| accounts::by_id_for_admin(conn, account.id, admin))
            .unwrap();
        assert_eq!(loaded.cash_balance, dec!(10000));
        assert_eq!(loaded.status, AccountStatus::Active);

        let err = store
            .with_conn(|conn| accounts::by_id_for_admin(conn, account.id, other_admin))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn duplicate_ref_mid_conflicts() {
        let store = Store::open_in_memory().unwrap();
        let admin = Uuid::new_v4();
        let first = sample_account(admin);
        let mut second = sample_account(admin);
        second.id = Uuid::new_v4();
        second.accode = "ANJ-02".into();
        // same ref_mid as `first`

        store.with_tx(|tx| accounts::insert(tx, &first)).unwrap();
        let err = store
            .with_tx(|tx| accounts::insert(tx, &second))
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn duplicate_accode_per_admin_conflicts() {
        let store = Store::open_in_memory().unwrap();
        let admin = Uuid::new_v4();
        let first = sample_account(admin);
        let mut second = sample_account(admin);
        second.id = Uuid::new_v4();
        second.ref_mid = "10999".into();
        // same accode under the same admin

        store.with_tx(|tx| accounts::insert(tx, &first)).unwrap();
        assert!(store.with_tx(|tx| accounts::insert(tx, &second)).is_err());

        // The same accode under a different admin is fine.
        let mut third = sample_account(Uuid::new_v4());
        third.ref_mid = "10777".into();
        store.with_tx(|tx| accounts::insert(tx, &third)).unwrap();
    }

    #[test]
    fn order_lookup_is_admin_scoped() {
        let store = Store::open_in_memory().unwrap();
        let admin = Uuid::new_v4();
        let user = Uuid::new_v4();
        let order = sample_order(user, admin);

        store.with_tx(|tx| orders::insert(tx, &order)).unwrap();
        assert!(store
            .with_conn(|conn| orders::by_id_for_admin(conn, order.id, admin))
            .is_ok());
        assert!(matches!(
            store
                .with_conn(|conn| orders::by_id_for_admin(conn, order.id, Uuid::new_v4()))
                .unwrap_err(),
            StoreError::NotFound(_)
        ));
    }

    #[test]
    fn processing_orders_filter_by_status() {
        let store = Store::open_in_memory().unwrap();
        let admin = Uuid::new_v4();
        let user = Uuid::new_v4();
        let open = sample_order(user, admin);
        let mut closed = sample_order(user, admin);
        closed.status = OrderStatus::Closed;

        store.with_tx(|tx| {
            orders::insert(tx, &open)?;
            orders::insert(tx, &closed)
        })
        .unwrap();

        let processing = store
            .with_conn(|conn| orders::processing_for_user(conn, user))
            .unwrap();
        assert_eq!(processing.len(), 1);
        assert_eq!(processing[0].id, open.id);
    }

    #[test]
    fn ledger_signed_sum_tracks_transaction_entries() {
        let store = Store::open_in_memory().unwrap();
        let admin = Uuid::new_v4();
        let user = Uuid::new_v4();

        let entry = |nature: EntryNature, amount: Decimal, balance: Decimal| LedgerEntry {
            entry_id: bullion_core::identifiers::next_entry_id(EntryKind::Transaction),
            kind: EntryKind::Transaction,
            nature,
            reference_number: "ORD-1".into(),
            amount,
            running_balance: balance,
            date: Utc::now(),
            user,
            admin_id: admin,
            details: EntryDetails::Transaction {
                asset: Asset::Cash,
                previous_balance: balance - nature.sign() * amount,
            },
            description: "test".into(),
            notes: None,
        };

        store
            .with_tx(|tx| {
                ledger::append(tx, &entry(EntryNature::Credit, dec!(500), dec!(500)))?;
                ledger::append(tx, &entry(EntryNature::Debit, dec!(120), dec!(380)))
            })
            .unwrap();

        let sum = store
            .with_conn(|conn| ledger::signed_sum(conn, user, Asset::Cash))
            .unwrap();
        assert_eq!(sum, dec!(380));
        let gold = store
            .with_conn(|conn| ledger::signed_sum(conn, user, Asset::Gold))
            .unwrap();
        assert_eq!(gold, dec!(0));
    }

    #[test]
    fn ledger_pagination_orders_by_date_desc() {
        let store = Store::open_in_memory().unwrap();
        let admin = Uuid::new_v4();
        let user = Uuid::new_v4();

        store
            .with_tx(|tx| {
                for day in 1..=3 {
                    let date = Utc::now() + chrono::Duration::days(day);
                    ledger::append(
                        tx,
                        &LedgerEntry {
                            entry_id: bullion_core::identifiers::next_entry_id(EntryKind::Order),
                            kind: EntryKind::Order,
                            nature: EntryNature::Debit,
                            reference_number: format!("ORD-{day}"),
                            amount: dec!(1),
                            running_balance: dec!(1),
                            date,
                            user,
                            admin_id: admin,
                            details: EntryDetails::Order {
                                side: Side::Buy,
                                volume: dec!(1),
                                opening_price: dec!(1900),
                            },
                            description: "test".into(),
                            notes: None,
                        },
                    )?;
                }
                Ok(())
            })
            .unwrap();

        let page = store
            .with_conn(|conn| ledger::list_for_user(conn, user, 2, 0))
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].reference_number, "ORD-3");
        let rest = store
            .with_conn(|conn| ledger::list_for_user(conn, user, 2, 2))
            .unwrap();
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn transaction_round_trips() {
        let store = Store::open_in_memory().unwrap();
        let record = CashTransaction {
            transaction_id: bullion_core::identifiers::next_transaction_id(),
            kind: TransactionKind::Deposit,
            asset: Asset::Cash,
            amount: dec!(500),
            user: Uuid::new_v4(),
            admin_id: Uuid::new_v4(),
            previous_balance: dec!(0),
            new_balance: dec!(500),
            status: TransactionStatus::Completed,
            created_at: Utc::now(),
        };

        store
            .with_tx(|tx| transactions::insert(tx, &record))
            .unwrap();
        let loaded = store
            .with_conn(|conn| transactions::by_id(conn, &record.transaction_id))
            .unwrap();
        assert_eq!(loaded.new_balance, dec!(500));
        assert_eq!(loaded.status, TransactionStatus::Completed);

        store
            .with_tx(|tx| {
                transactions::update_status(
                    tx,
                    &record.transaction_id,
                    TransactionStatus::Cancelled,
                )
            })
            .unwrap();
        let cancelled = store
            .with_conn(|conn| transactions::by_id(conn, &record.transaction_id))
            .unwrap();
        assert_eq!(cancelled.status, TransactionStatus::Cancelled);
    }
}
