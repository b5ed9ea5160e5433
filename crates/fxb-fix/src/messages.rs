//! Typed builders and parsed views over raw frames.
//!
//! Builders return body fields in wire order; the session writer adds the
//! standard header and the codec computes framing. Views borrow a decoded
//! `RawMessage` and pull out the fields the gateway acts on.

use crate::codec::{sending_time, RawMessage};
use crate::error::{FixError, FixResult};
use crate::fields::{md_action, md_entry, ord_status, ord_type, side, tag};
use fxb_core::{OrderSide, OrderType, Price, Volume};
use rust_decimal::Decimal;

// === Builders (outbound) ===

/// Logon body: encryption off, heartbeat interval, optional credentials.
pub fn logon_body(
    heartbeat_secs: u64,
    reset_seq: bool,
    username: Option<&str>,
    password: Option<&str>,
) -> Vec<(u32, String)> {
    let mut body = vec![
        (tag::ENCRYPT_METHOD, "0".to_string()),
        (tag::HEART_BT_INT, heartbeat_secs.to_string()),
    ];
    if reset_seq {
        body.push((tag::RESET_SEQ_NUM_FLAG, "Y".to_string()));
    }
    if let Some(u) = username {
        body.push((tag::USERNAME, u.to_string()));
    }
    if let Some(p) = password {
        body.push((tag::PASSWORD, p.to_string()));
    }
    body
}

pub fn heartbeat_body(test_req_id: Option<&str>) -> Vec<(u32, String)> {
    match test_req_id {
        Some(id) => vec![(tag::TEST_REQ_ID, id.to_string())],
        None => Vec::new(),
    }
}

pub fn test_request_body(test_req_id: &str) -> Vec<(u32, String)> {
    vec![(tag::TEST_REQ_ID, test_req_id.to_string())]
}

/// EndSeqNo 0 means "everything from BeginSeqNo".
pub fn resend_request_body(begin_seq_no: u64, end_seq_no: u64) -> Vec<(u32, String)> {
    vec![
        (tag::BEGIN_SEQ_NO, begin_seq_no.to_string()),
        (tag::END_SEQ_NO, end_seq_no.to_string()),
    ]
}

pub fn sequence_reset_gap_fill_body(new_seq_no: u64) -> Vec<(u32, String)> {
    vec![
        (tag::GAP_FILL_FLAG, "Y".to_string()),
        (tag::NEW_SEQ_NO, new_seq_no.to_string()),
    ]
}

pub fn logout_body(text: Option<&str>) -> Vec<(u32, String)> {
    match text {
        Some(t) => vec![(tag::TEXT, t.to_string())],
        None => Vec::new(),
    }
}

/// SecurityDefinitionRequest announcing an instrument before the first
/// market-data subscribe for it.
pub fn security_definition_request_body(
    req_id: &str,
    symbol: &str,
    product: u32,
    security_type: &str,
    security_exchange: &str,
    currency: &str,
) -> Vec<(u32, String)> {
    vec![
        (tag::SECURITY_REQ_ID, req_id.to_string()),
        // 3 = request security types for a given instrument
        (tag::SECURITY_REQUEST_TYPE, "3".to_string()),
        (tag::SYMBOL, symbol.to_string()),
        (tag::PRODUCT, product.to_string()),
        (tag::SECURITY_TYPE, security_type.to_string()),
        (tag::SECURITY_EXCHANGE, security_exchange.to_string()),
        (tag::CURRENCY, currency.to_string()),
    ]
}

/// Top-of-book subscribe (subscription_type "1") or unsubscribe ("2").
#[allow(clippy::too_many_arguments)]
pub fn market_data_request_body(
    req_id: &str,
    subscribe: bool,
    symbol: &str,
    product: u32,
    security_type: &str,
    security_exchange: &str,
    currency: &str,
) -> Vec<(u32, String)> {
    vec![
        (tag::MD_REQ_ID, req_id.to_string()),
        (
            tag::SUBSCRIPTION_REQUEST_TYPE,
            if subscribe { "1" } else { "2" }.to_string(),
        ),
        (tag::MARKET_DEPTH, "1".to_string()),
        (tag::MD_UPDATE_TYPE, "0".to_string()),
        (tag::NO_MD_ENTRY_TYPES, "2".to_string()),
        (tag::MD_ENTRY_TYPE, md_entry::BID.to_string()),
        (tag::MD_ENTRY_TYPE, md_entry::OFFER.to_string()),
        (tag::NO_RELATED_SYM, "1".to_string()),
        (tag::SYMBOL, symbol.to_string()),
        (tag::PRODUCT, product.to_string()),
        (tag::SECURITY_TYPE, security_type.to_string()),
        (tag::SECURITY_EXCHANGE, security_exchange.to_string()),
        (tag::CURRENCY, currency.to_string()),
    ]
}

/// NewOrderSingle for routed (A-book) order flow.
pub fn new_order_single_body(
    cl_ord_id: &str,
    symbol: &str,
    order_side: OrderSide,
    order_type: OrderType,
    quantity: Volume,
    price: Option<Price>,
) -> Vec<(u32, String)> {
    let mut body = vec![
        (tag::CL_ORD_ID, cl_ord_id.to_string()),
        // 1 = automated execution, no broker intervention
        (tag::HANDL_INST, "1".to_string()),
        (tag::SYMBOL, symbol.to_string()),
        (
            tag::SIDE,
            match order_side {
                OrderSide::Buy => side::BUY,
                OrderSide::Sell => side::SELL,
            }
            .to_string(),
        ),
        (tag::TRANSACT_TIME, sending_time()),
        (tag::ORDER_QTY, quantity.inner().to_string()),
        (
            tag::ORD_TYPE,
            match order_type {
                OrderType::Market => ord_type::MARKET,
                _ => ord_type::LIMIT,
            }
            .to_string(),
        ),
    ];
    if let Some(px) = price {
        body.push((tag::PRICE, px.inner().to_string()));
    }
    body
}

// === Views (inbound) ===

/// One side of a top-of-book market data entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MdSide {
    Bid,
    Offer,
}

/// One market data entry from a snapshot or incremental refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct MdEntry {
    pub side: MdSide,
    /// None on delete actions.
    pub price: Option<Price>,
    pub symbol: Option<String>,
    pub deleted: bool,
}

/// Parsed MarketDataSnapshot (W) or IncrementalRefresh (X).
#[derive(Debug, Clone, PartialEq)]
pub struct MarketDataUpdate {
    /// Symbol from the message header position, if present.
    pub symbol: Option<String>,
    pub entries: Vec<MdEntry>,
}

impl MarketDataUpdate {
    /// Walk repeating groups delimited by MDEntryType (snapshot) or
    /// MDUpdateAction (incremental). Fields between delimiters belong to
    /// the current entry.
    pub fn parse(msg: &RawMessage) -> FixResult<Self> {
        let top_symbol = msg.get(tag::SYMBOL).map(|s| s.to_string());
        let mut entries: Vec<MdEntry> = Vec::new();
        let mut current: Option<MdEntry> = None;

        for (t, v) in msg.fields() {
            match *t {
                tag::MD_UPDATE_ACTION => {
                    if let Some(entry) = current.take() {
                        entries.push(entry);
                    }
                    current = Some(MdEntry {
                        side: MdSide::Bid,
                        price: None,
                        symbol: None,
                        deleted: v == md_action::DELETE,
                    });
                }
                tag::MD_ENTRY_TYPE => {
                    let side = match v.as_str() {
                        md_entry::BID => MdSide::Bid,
                        md_entry::OFFER => MdSide::Offer,
                        other => {
                            return Err(FixError::InvalidValue {
                                tag: tag::MD_ENTRY_TYPE,
                                value: other.to_string(),
                            })
                        }
                    };
                    match current.as_mut() {
                        // Incremental: action came first, set the side.
                        Some(entry) if entry.price.is_none() && entry.symbol.is_none() => {
                            entry.side = side;
                        }
                        // Snapshot: MDEntryType starts a new entry.
                        _ => {
                            if let Some(entry) = current.take() {
                                entries.push(entry);
                            }
                            current = Some(MdEntry {
                                side,
                                price: None,
                                symbol: None,
                                deleted: false,
                            });
                        }
                    }
                }
                tag::MD_ENTRY_PX => {
                    if let Some(entry) = current.as_mut() {
                        let px: Decimal = v.parse().map_err(|_| FixError::InvalidValue {
                            tag: tag::MD_ENTRY_PX,
                            value: v.clone(),
                        })?;
                        entry.price = Some(Price::new(px));
                    }
                }
                tag::SYMBOL => {
                    if let Some(entry) = current.as_mut() {
                        entry.symbol = Some(v.clone());
                    }
                }
                _ => {}
            }
        }
        if let Some(entry) = current.take() {
            entries.push(entry);
        }

        Ok(Self {
            symbol: top_symbol,
            entries,
        })
    }
}

/// Parsed ExecutionReport (8).
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub cl_ord_id: String,
    pub order_id: String,
    pub symbol: String,
    pub ord_status: ExecStatus,
    pub last_price: Option<Price>,
    pub last_qty: Option<Volume>,
    pub cum_qty: Option<Volume>,
    pub avg_price: Option<Price>,
    pub text: Option<String>,
}

/// Order status on an ExecutionReport, reduced to what the engine acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl ExecutionReport {
    pub fn parse(msg: &RawMessage) -> FixResult<Self> {
        let ord_status = match msg.require(tag::ORD_STATUS)? {
            ord_status::NEW => ExecStatus::New,
            ord_status::PARTIALLY_FILLED => ExecStatus::PartiallyFilled,
            ord_status::FILLED => ExecStatus::Filled,
            ord_status::CANCELED => ExecStatus::Canceled,
            ord_status::REJECTED => ExecStatus::Rejected,
            other => {
                return Err(FixError::InvalidValue {
                    tag: tag::ORD_STATUS,
                    value: other.to_string(),
                })
            }
        };

        Ok(Self {
            cl_ord_id: msg.require(tag::CL_ORD_ID)?.to_string(),
            order_id: msg.require(tag::ORDER_ID)?.to_string(),
            symbol: msg.require(tag::SYMBOL)?.to_string(),
            ord_status,
            last_price: parse_opt_decimal(msg, tag::LAST_PX)?.map(Price::new),
            last_qty: parse_opt_decimal(msg, tag::LAST_QTY)?.map(Volume::new),
            cum_qty: parse_opt_decimal(msg, tag::CUM_QTY)?.map(Volume::new),
            avg_price: parse_opt_decimal(msg, tag::AVG_PX)?.map(Price::new),
            text: msg.get(tag::TEXT).map(|s| s.to_string()),
        })
    }
}

fn parse_opt_decimal(msg: &RawMessage, t: u32) -> FixResult<Option<Decimal>> {
    match msg.get(t) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| FixError::InvalidValue {
                tag: t,
                value: raw.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_message, FrameDecoder};
    use crate::fields::msg_type;
    use rust_decimal_macros::dec;

    fn roundtrip(msg_type: &str, body: Vec<(u32, String)>) -> RawMessage {
        let bytes = encode_message(msg_type, 1, "FXB", "LP1", &body);
        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        decoder.next_frame().unwrap().unwrap()
    }

    #[test]
    fn logon_fields() {
        let msg = roundtrip(
            msg_type::LOGON,
            logon_body(30, true, Some("user"), Some("pass")),
        );
        assert_eq!(msg.get(tag::HEART_BT_INT), Some("30"));
        assert_eq!(msg.get(tag::RESET_SEQ_NUM_FLAG), Some("Y"));
        assert_eq!(msg.get(tag::USERNAME), Some("user"));
    }

    #[test]
    fn md_request_carries_instrument_routing() {
        let msg = roundtrip(
            msg_type::MARKET_DATA_REQUEST,
            market_data_request_body("md-1", true, "EURUSD", 4, "FOR", "XOFF", "USD"),
        );
        assert_eq!(msg.get(tag::MD_REQ_ID), Some("md-1"));
        assert_eq!(msg.get(tag::SUBSCRIPTION_REQUEST_TYPE), Some("1"));
        assert_eq!(msg.get(tag::PRODUCT), Some("4"));
        assert_eq!(msg.get(tag::SECURITY_TYPE), Some("FOR"));
        assert_eq!(msg.get(tag::SECURITY_EXCHANGE), Some("XOFF"));
        assert_eq!(msg.get(tag::CURRENCY), Some("USD"));
    }

    #[test]
    fn snapshot_parses_both_sides() {
        let msg = roundtrip(
            msg_type::MARKET_DATA_SNAPSHOT,
            vec![
                (tag::MD_REQ_ID, "md-1".into()),
                (tag::SYMBOL, "EURUSD".into()),
                (tag::NO_MD_ENTRIES, "2".into()),
                (tag::MD_ENTRY_TYPE, "0".into()),
                (tag::MD_ENTRY_PX, "1.0850".into()),
                (tag::MD_ENTRY_TYPE, "1".into()),
                (tag::MD_ENTRY_PX, "1.0851".into()),
            ],
        );
        let update = MarketDataUpdate::parse(&msg).unwrap();
        assert_eq!(update.symbol.as_deref(), Some("EURUSD"));
        assert_eq!(update.entries.len(), 2);
        assert_eq!(update.entries[0].side, MdSide::Bid);
        assert_eq!(update.entries[0].price, Some(Price::new(dec!(1.0850))));
        assert_eq!(update.entries[1].side, MdSide::Offer);
        assert_eq!(update.entries[1].price, Some(Price::new(dec!(1.0851))));
    }

    #[test]
    fn incremental_parses_actions() {
        let msg = roundtrip(
            msg_type::MARKET_DATA_INCREMENTAL,
            vec![
                (tag::NO_MD_ENTRIES, "2".into()),
                (tag::MD_UPDATE_ACTION, "1".into()),
                (tag::MD_ENTRY_TYPE, "0".into()),
                (tag::SYMBOL, "EURUSD".into()),
                (tag::MD_ENTRY_PX, "1.0849".into()),
                (tag::MD_UPDATE_ACTION, "2".into()),
                (tag::MD_ENTRY_TYPE, "1".into()),
                (tag::SYMBOL, "EURUSD".into()),
            ],
        );
        let update = MarketDataUpdate::parse(&msg).unwrap();
        assert_eq!(update.entries.len(), 2);
        assert_eq!(update.entries[0].price, Some(Price::new(dec!(1.0849))));
        assert!(!update.entries[0].deleted);
        assert_eq!(update.entries[0].symbol.as_deref(), Some("EURUSD"));
        assert!(update.entries[1].deleted);
        assert_eq!(update.entries[1].price, None);
    }

    #[test]
    fn execution_report_parses() {
        let msg = roundtrip(
            msg_type::EXECUTION_REPORT,
            vec![
                (tag::CL_ORD_ID, "fxb-42".into()),
                (tag::ORDER_ID, "lp-777".into()),
                (tag::EXEC_ID, "e-1".into()),
                (tag::ORD_STATUS, "2".into()),
                (tag::EXEC_TYPE, "F".into()),
                (tag::SYMBOL, "EURUSD".into()),
                (tag::SIDE, "1".into()),
                (tag::LAST_QTY, "0.10".into()),
                (tag::LAST_PX, "1.0855".into()),
                (tag::CUM_QTY, "0.10".into()),
                (tag::AVG_PX, "1.0855".into()),
            ],
        );
        let report = ExecutionReport::parse(&msg).unwrap();
        assert_eq!(report.cl_ord_id, "fxb-42");
        assert_eq!(report.ord_status, ExecStatus::Filled);
        assert_eq!(report.last_price, Some(Price::new(dec!(1.0855))));
        assert_eq!(report.last_qty, Some(Volume::new(dec!(0.10))));
    }

    #[test]
    fn execution_report_missing_status_fails() {
        let msg = roundtrip(
            msg_type::EXECUTION_REPORT,
            vec![(tag::CL_ORD_ID, "fxb-42".into())],
        );
        assert!(matches!(
            ExecutionReport::parse(&msg),
            Err(FixError::MissingTag(_))
        ));
    }
}
