//! Parsing of upstream feed frames.
//!
//! The feed multiplexes token creations, trades, and subscription
//! acknowledgements over one socket, discriminated by a `txType` tag and
//! carrying both camelCase and snake_case field spellings depending on the
//! venue. Frames parse into a closed sum type; unknown shapes are reported,
//! logged by the caller, and dropped, never panicked on.

use chrono::Utc;
use serde::Deserialize;

use crate::core::{MarketEvent, NewTokenEvent, TradeEvent};

/// Universal wire frame covering every format the feed emits.
#[derive(Debug, Deserialize)]
pub struct RawFeedFrame {
    pub mint: Option<String>,
    pub name: Option<String>,
    pub symbol: Option<String>,

    #[serde(alias = "txType", alias = "tx_type")]
    pub tx_type: Option<String>,

    #[serde(alias = "traderPublicKey", alias = "trader_public_key")]
    pub trader_public_key: Option<String>,

    #[serde(alias = "solAmount", alias = "sol_amount")]
    pub sol_amount: Option<f64>,

    #[serde(alias = "tokenAmount", alias = "token_amount")]
    pub token_amount: Option<f64>,

    #[serde(alias = "marketCapSol", alias = "market_cap_sol")]
    pub market_cap_sol: Option<f64>,

    #[serde(alias = "vSolInBondingCurve", alias = "v_sol_in_bonding_curve")]
    pub v_sol_in_bonding_curve: Option<f64>,

    #[serde(alias = "vTokensInBondingCurve", alias = "v_tokens_in_bonding_curve")]
    pub v_tokens_in_bonding_curve: Option<f64>,

    #[serde(alias = "initialBuy", alias = "initial_buy")]
    pub initial_buy: Option<f64>,

    #[serde(alias = "holderCount", alias = "holder_count")]
    pub holder_count: Option<u64>,

    pub signature: Option<String>,
    pub uri: Option<String>,
    pub message: Option<String>,
}

/// Everything one inbound frame can turn into.
#[derive(Debug)]
pub enum FeedMessage {
    NewToken(NewTokenEvent),
    Trade(TradeEvent),
    SubscriptionAck { message: String },
    Unknown { tx_type: Option<String> },
}

impl FeedMessage {
    pub fn into_market_event(self) -> Option<MarketEvent> {
        match self {
            FeedMessage::NewToken(e) => Some(MarketEvent::NewToken(e)),
            FeedMessage::Trade(e) => Some(MarketEvent::Trade(e)),
            _ => None,
        }
    }
}

/// Parse one text frame. Malformed JSON and unrecognized tags both land in
/// `Unknown`.
pub fn parse_frame(text: &str) -> FeedMessage {
    let frame: RawFeedFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(_) => return FeedMessage::Unknown { tx_type: None },
    };

    if let Some(message) = &frame.message {
        if message.contains("Successfully subscribed")
            || message.contains("Successfully unsubscribed")
        {
            return FeedMessage::SubscriptionAck {
                message: message.clone(),
            };
        }
    }

    match frame.tx_type.as_deref() {
        Some("create") => match new_token_from(&frame) {
            Some(event) => FeedMessage::NewToken(event),
            None => FeedMessage::Unknown {
                tx_type: frame.tx_type,
            },
        },
        Some("buy") | Some("sell") => match trade_from(&frame) {
            Some(event) => FeedMessage::Trade(event),
            None => FeedMessage::Unknown {
                tx_type: frame.tx_type,
            },
        },
        other => FeedMessage::Unknown {
            tx_type: other.map(str::to_string),
        },
    }
}

/// Spot price implied by the bonding curve reserves, when both sides are
/// present and positive.
fn curve_price(frame: &RawFeedFrame) -> Option<f64> {
    match (frame.v_sol_in_bonding_curve, frame.v_tokens_in_bonding_curve) {
        (Some(sol), Some(tokens)) if sol > 0.0 && tokens > 0.0 => Some(sol / tokens),
        _ => None,
    }
}

fn new_token_from(frame: &RawFeedFrame) -> Option<NewTokenEvent> {
    let mint = frame.mint.clone()?;
    let symbol = frame.symbol.clone()?;
    Some(NewTokenEvent {
        mint,
        symbol,
        name: frame.name.clone().unwrap_or_default(),
        price: curve_price(frame),
        volume_24h: frame.initial_buy,
        market_cap: frame.market_cap_sol,
        liquidity: frame.v_sol_in_bonding_curve,
        holders: frame.holder_count,
        uri: frame.uri.clone(),
        timestamp: Utc::now(),
    })
}

fn trade_from(frame: &RawFeedFrame) -> Option<TradeEvent> {
    let mint = frame.mint.clone()?;
    let side = frame.tx_type.clone()?;
    Some(TradeEvent {
        mint,
        side,
        amount: frame.token_amount.or(frame.sol_amount).unwrap_or(0.0),
        price: curve_price(frame).unwrap_or(0.0),
        wallet: frame.trader_public_key.clone().unwrap_or_default(),
        signature: frame.signature.clone().unwrap_or_default(),
        timestamp: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_create_frame_with_camel_case_fields() {
        let text = r#"{
            "mint": "8GkHcZq1pump",
            "name": "Test Token",
            "symbol": "TEST",
            "txType": "create",
            "traderPublicKey": "CreatorWallet111",
            "initialBuy": 2.5,
            "marketCapSol": 30.0,
            "vSolInBondingCurve": 31.0,
            "vTokensInBondingCurve": 1000000.0,
            "uri": "https://meta.example/test.json"
        }"#;

        match parse_frame(text) {
            FeedMessage::NewToken(event) => {
                assert_eq!(event.mint, "8GkHcZq1pump");
                assert_eq!(event.symbol, "TEST");
                assert_eq!(event.price, Some(31.0 / 1_000_000.0));
                assert_eq!(event.liquidity, Some(31.0));
                assert_eq!(event.uri.as_deref(), Some("https://meta.example/test.json"));
            }
            other => panic!("expected NewToken, got {:?}", other),
        }
    }

    #[test]
    fn parses_trade_frame_with_snake_case_fields() {
        let text = r#"{
            "mint": "8GkHcZq1pump",
            "name": "Test Token",
            "symbol": "TEST",
            "tx_type": "sell",
            "trader_public_key": "SellerWallet111",
            "sol_amount": 0.75,
            "token_amount": 12000.0,
            "v_sol_in_bonding_curve": 29.0,
            "v_tokens_in_bonding_curve": 1100000.0,
            "signature": "5SigSigSigSig"
        }"#;

        match parse_frame(text) {
            FeedMessage::Trade(event) => {
                assert_eq!(event.side, "sell");
                assert_eq!(event.amount, 12000.0);
                assert_eq!(event.wallet, "SellerWallet111");
                assert_eq!(event.signature, "5SigSigSigSig");
                assert!(event.price > 0.0);
            }
            other => panic!("expected Trade, got {:?}", other),
        }
    }

    #[test]
    fn subscription_ack_is_recognized() {
        let text = r#"{"message": "Successfully subscribed to token trades"}"#;
        match parse_frame(text) {
            FeedMessage::SubscriptionAck { message } => {
                assert!(message.contains("subscribed"));
            }
            other => panic!("expected SubscriptionAck, got {:?}", other),
        }
    }

    #[test]
    fn unknown_tag_and_malformed_json_never_panic() {
        assert!(matches!(
            parse_frame(r#"{"txType": "migrate", "mint": "X"}"#),
            FeedMessage::Unknown { tx_type: Some(t) } if t == "migrate"
        ));
        assert!(matches!(
            parse_frame("not json at all"),
            FeedMessage::Unknown { tx_type: None }
        ));
    }
}
