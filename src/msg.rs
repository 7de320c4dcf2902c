use serde::{Serialize, Deserialize};

use crate::{account, block, round, txn};

pub mod ticket {
    use super::*;

    /// Cheap claim of a sharder's latest finalized round, gossiped instead of blocks.
    #[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Default)]
    pub struct Ticket {
        pub round: i64,
        pub timestamp: i64,
        pub sharder: account::NodeId,
    }
}

pub mod phase {
    use super::*;

    #[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy)]
    #[serde(rename_all = "snake_case")]
    pub enum Kind {
        Start,
        Contribute,
        Share,
        Publish,
        Wait,
    }

    #[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
    pub struct Phase {
        pub phase: Kind,
        pub start_round: i64,
        pub current_round: i64,
    }
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Request {
    LatestRound,
    LfbTicket,
    Round { number: i64 },
    Block { round: i64 },
    BlockByHash { hash: String, round: i64 },
    Phase,
    SharderKeepList,
    SubmitTxn { txn: txn::Txn },
    TxnConfirmation { hash: String },
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Response {
    Round(round::Round),
    Ticket(ticket::Ticket),
    Block(block::Block),
    Phase(phase::Phase),
    Members(Vec<account::NodeId>),
    Accepted,
    Confirmation(txn::Summary),
}

impl Response {
    pub fn into_block(self) -> Option<block::Block> {
        match self {
            Response::Block(b) => Some(b),
            _ => None,
        }
    }

    pub fn into_round(self) -> Option<round::Round> {
        match self {
            Response::Round(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_ticket(self) -> Option<ticket::Ticket> {
        match self {
            Response::Ticket(t) => Some(t),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape() {
        let req = serde_json::to_value(Request::Block { round: 7 }).unwrap();
        assert_eq!(req, serde_json::json!({ "kind": "block", "round": 7 }));
        let resp = Response::Ticket(ticket::Ticket { round: 9, timestamp: 1, sharder: String::from("s") });
        let back: Response = serde_json::from_str(&serde_json::to_string(&resp).unwrap()).unwrap();
        assert_eq!(back.into_ticket().map(|t| t.round), Some(9));
        assert_eq!(Response::Accepted.into_block(), None);
    }
}
