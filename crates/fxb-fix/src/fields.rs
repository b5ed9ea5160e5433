//! FIX 4.4 tag dictionary, limited to the subset the gateway speaks.

/// Protocol version carried in every BeginString.
pub const BEGIN_STRING: &str = "FIX.4.4";

/// Field separator.
pub const SOH: u8 = 0x01;

/// Standard header and trailer tags.
pub mod tag {
    pub const BEGIN_STRING: u32 = 8;
    pub const BODY_LENGTH: u32 = 9;
    pub const CHECK_SUM: u32 = 10;
    pub const CL_ORD_ID: u32 = 11;
    pub const CURRENCY: u32 = 15;
    pub const EXEC_ID: u32 = 17;
    pub const HANDL_INST: u32 = 21;
    pub const MSG_SEQ_NUM: u32 = 34;
    pub const MSG_TYPE: u32 = 35;
    pub const NEW_SEQ_NO: u32 = 36;
    pub const ORDER_ID: u32 = 37;
    pub const ORDER_QTY: u32 = 38;
    pub const ORD_STATUS: u32 = 39;
    pub const ORD_TYPE: u32 = 40;
    pub const PRICE: u32 = 44;
    pub const REF_SEQ_NUM: u32 = 45;
    pub const SENDER_COMP_ID: u32 = 49;
    pub const SENDING_TIME: u32 = 52;
    pub const SIDE: u32 = 54;
    pub const SYMBOL: u32 = 55;
    pub const TARGET_COMP_ID: u32 = 56;
    pub const TEXT: u32 = 58;
    pub const TIME_IN_FORCE: u32 = 59;
    pub const TRANSACT_TIME: u32 = 60;
    pub const AVG_PX: u32 = 6;
    pub const BEGIN_SEQ_NO: u32 = 7;
    pub const CUM_QTY: u32 = 14;
    pub const END_SEQ_NO: u32 = 16;
    pub const LAST_PX: u32 = 31;
    pub const LAST_QTY: u32 = 32;
    pub const POSS_DUP_FLAG: u32 = 43;
    pub const ENCRYPT_METHOD: u32 = 98;
    pub const HEART_BT_INT: u32 = 108;
    pub const TEST_REQ_ID: u32 = 112;
    pub const ORIG_SENDING_TIME: u32 = 122;
    pub const GAP_FILL_FLAG: u32 = 123;
    pub const RESET_SEQ_NUM_FLAG: u32 = 141;
    pub const NO_RELATED_SYM: u32 = 146;
    pub const EXEC_TYPE: u32 = 150;
    pub const LEAVES_QTY: u32 = 151;
    pub const SECURITY_TYPE: u32 = 167;
    pub const SECURITY_EXCHANGE: u32 = 207;
    pub const MD_REQ_ID: u32 = 262;
    pub const SUBSCRIPTION_REQUEST_TYPE: u32 = 263;
    pub const MARKET_DEPTH: u32 = 264;
    pub const MD_UPDATE_TYPE: u32 = 265;
    pub const NO_MD_ENTRY_TYPES: u32 = 267;
    pub const NO_MD_ENTRIES: u32 = 268;
    pub const MD_ENTRY_TYPE: u32 = 269;
    pub const MD_ENTRY_PX: u32 = 270;
    pub const MD_ENTRY_SIZE: u32 = 271;
    pub const MD_UPDATE_ACTION: u32 = 279;
    pub const SECURITY_REQ_ID: u32 = 320;
    pub const SECURITY_REQUEST_TYPE: u32 = 321;
    pub const REF_MSG_TYPE: u32 = 372;
    pub const SESSION_REJECT_REASON: u32 = 373;
    pub const PRODUCT: u32 = 460;
    pub const USERNAME: u32 = 553;
    pub const PASSWORD: u32 = 554;
}

/// Message types the gateway handles.
pub mod msg_type {
    pub const HEARTBEAT: &str = "0";
    pub const TEST_REQUEST: &str = "1";
    pub const RESEND_REQUEST: &str = "2";
    pub const REJECT: &str = "3";
    pub const SEQUENCE_RESET: &str = "4";
    pub const LOGOUT: &str = "5";
    pub const EXECUTION_REPORT: &str = "8";
    pub const LOGON: &str = "A";
    pub const NEW_ORDER_SINGLE: &str = "D";
    pub const MARKET_DATA_REQUEST: &str = "V";
    pub const MARKET_DATA_SNAPSHOT: &str = "W";
    pub const MARKET_DATA_INCREMENTAL: &str = "X";
    pub const SECURITY_DEFINITION_REQUEST: &str = "c";

    /// Session-level administrative types, gap-filled rather than resent.
    pub fn is_admin(mt: &str) -> bool {
        matches!(
            mt,
            HEARTBEAT | TEST_REQUEST | RESEND_REQUEST | REJECT | SEQUENCE_RESET | LOGOUT | LOGON
        )
    }
}

/// MDEntryType values for top-of-book.
pub mod md_entry {
    pub const BID: &str = "0";
    pub const OFFER: &str = "1";
}

/// MDUpdateAction values.
pub mod md_action {
    pub const NEW: &str = "0";
    pub const CHANGE: &str = "1";
    pub const DELETE: &str = "2";
}

/// Side values on order messages.
pub mod side {
    pub const BUY: &str = "1";
    pub const SELL: &str = "2";
}

/// OrdType values on NewOrderSingle.
pub mod ord_type {
    pub const MARKET: &str = "1";
    pub const LIMIT: &str = "2";
}

/// OrdStatus values on ExecutionReport.
pub mod ord_status {
    pub const NEW: &str = "0";
    pub const PARTIALLY_FILLED: &str = "1";
    pub const FILLED: &str = "2";
    pub const CANCELED: &str = "4";
    pub const REJECTED: &str = "8";
}
