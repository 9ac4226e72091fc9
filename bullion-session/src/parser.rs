//! Inbound message parser.
//!
//! Evaluated on every message before state dispatch. Short-codes beat close
//! commands, close commands beat the special keywords, and anything left is
//! handed to the state machine as plain text.

use std::str::FromStr;

use rust_decimal::Decimal;

use bullion_core::Side;

/// Target of a `CLOSE` command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CloseTarget {
    /// 1-based index into the session's cached open orders.
    Index(usize),
    /// Explicit order number, e.g. `ORD-17`.
    OrderNo(String),
}

/// A parsed inbound message.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// An order short-code. `side` is `None` for the `NTTB` and bare-number
    /// forms, which default to BUY outside the volume prompt.
    Shortcode {
        side: Option<Side>,
        volume: Decimal,
    },
    /// A bare number: menu choice, volume answer, or implicit BUY.
    Number(Decimal),
    Close(CloseTarget),
    Menu,
    Reset,
    Greet,
    Balance,
    Cancel,
    Price,
    Orders,
    Refresh,
    Statement,
    /// Anything else; resolved by the current session state.
    Text(String),
}

/// Parse one inbound message.
#[must_use]
pub fn parse(body: &str) -> Command {
    let trimmed = body.trim();
    let upper = trimmed.to_ascii_uppercase();
    let tokens: Vec<&str> = upper.split_whitespace().collect();

    // 1. Short-codes: "BUY 3", "SELL 2 TTB", "2TTB".
    if let Some(command) = parse_shortcode(&tokens, &upper) {
        return command;
    }

    // 2. CLOSE <index> / CLOSE <order no>.
    if tokens.len() == 2 && tokens[0] == "CLOSE" {
        if let Ok(index) = tokens[1].parse::<usize>() {
            if index >= 1 {
                return Command::Close(CloseTarget::Index(index));
            }
        }
        return Command::Close(CloseTarget::OrderNo(tokens[1].to_string()));
    }

    // 3. Special keywords.
    match upper.as_str() {
        "MENU" | "HELP" => return Command::Menu,
        "RESET" => return Command::Reset,
        "HI" | "HELLO" | "START" => return Command::Greet,
        "BALANCE" => return Command::Balance,
        "CANCEL" => return Command::Cancel,
        "PRICE" | "PRICES" => return Command::Price,
        "ORDERS" | "POSITIONS" => return Command::Orders,
        "REFRESH" => return Command::Refresh,
        "STATEMENT" => return Command::Statement,
        _ => {}
    }

    // 4. Bare number; menu digits and volumes disambiguate in the handler.
    if let Ok(volume) = Decimal::from_str(&upper) {
        return Command::Number(volume);
    }

    Command::Text(trimmed.to_string())
}

fn parse_shortcode(tokens: &[&str], upper: &str) -> Option<Command> {
    // "BUY 3" / "SELL 2 TTB"
    if tokens.len() >= 2 && (tokens[0] == "BUY" || tokens[0] == "SELL") {
        let side = if tokens[0] == "BUY" {
            Side::Buy
        } else {
            Side::Sell
        };
        let raw = tokens[1].trim_end_matches("TTB");
        if let Ok(volume) = Decimal::from_str(raw) {
            if volume > Decimal::ZERO && (tokens.len() == 2 || tokens[2] == "TTB") {
                return Some(Command::Shortcode {
                    side: Some(side),
                    volume,
                });
            }
        }
        return None;
    }

    // "2TTB" / "0.5 TTB"
    let compact = upper.replace(' ', "");
    if let Some(raw) = compact.strip_suffix("TTB") {
        if let Ok(volume) = Decimal::from_str(raw) {
            if volume > Decimal::ZERO {
                return Some(Command::Shortcode { side: None, volume });
            }
        }
    }
    None
}
