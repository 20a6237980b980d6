// 2.0: simulated trades. a position is open until closed_at is set, then terminal.
// 2.1 has the take-profit / stop-loss trigger rules at the bottom.

use crate::types::{Direction, EntryId, PositionId, Price, Symbol, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseReason {
    #[serde(rename = "manual")]
    Manual,
    #[serde(rename = "TP_hit")]
    TakeProfit,
    #[serde(rename = "SL_hit")]
    StopLoss,
    #[serde(rename = "forced_eod")]
    ForcedEndOfDay,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Manual => "manual",
            CloseReason::TakeProfit => "TP_hit",
            CloseReason::StopLoss => "SL_hit",
            CloseReason::ForcedEndOfDay => "forced_eod",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub entry_id: EntryId,
    pub symbol: Symbol,
    pub direction: Direction,
    pub lot_size: Decimal,
    pub entry_price: Price,
    pub take_profit: Option<Price>,
    pub stop_loss: Option<Price>,
    pub opened_at: Timestamp,
    pub closed_at: Option<Timestamp>,
    pub exit_price: Option<Price>,
    // percent, frozen at close
    pub current_pnl: Option<Decimal>,
    pub close_reason: Option<CloseReason>,
}

impl Position {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: PositionId,
        entry_id: EntryId,
        symbol: Symbol,
        direction: Direction,
        lot_size: Decimal,
        entry_price: Price,
        take_profit: Option<Price>,
        stop_loss: Option<Price>,
        opened_at: Timestamp,
    ) -> Self {
        Self {
            id,
            entry_id,
            symbol,
            direction,
            lot_size,
            entry_price,
            take_profit,
            stop_loss,
            opened_at,
            closed_at: None,
            exit_price: None,
            current_pnl: None,
            close_reason: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }

    pub fn has_targets(&self) -> bool {
        self.take_profit.is_some() || self.stop_loss.is_some()
    }

    // 2.2: terminal. callers check is_open first, under the entry lock.
    pub(crate) fn mark_closed(
        &mut self,
        exit_price: Price,
        pnl_percent: Decimal,
        reason: CloseReason,
        at: Timestamp,
    ) {
        debug_assert!(self.is_open(), "position {} closed twice", self.id);
        self.closed_at = Some(at);
        self.exit_price = Some(exit_price);
        self.current_pnl = Some(pnl_percent);
        self.close_reason = Some(reason);
    }

    /// Which target, if any, `price` has reached. Take-profit is evaluated
    /// first, so a gapped price through both levels closes as TP.
    pub fn check_trigger(&self, price: Price) -> Option<CloseReason> {
        if let Some(tp) = self.take_profit {
            if take_profit_condition(self.direction).crossed(tp, price) {
                return Some(CloseReason::TakeProfit);
            }
        }
        if let Some(sl) = self.stop_loss {
            if stop_loss_condition(self.direction).crossed(sl, price) {
                return Some(CloseReason::StopLoss);
            }
        }
        None
    }
}

/// How a trigger price is compared against the market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerCondition {
    /// Fires when price is at or above the trigger.
    Above,
    /// Fires when price is at or below the trigger.
    Below,
}

impl TriggerCondition {
    pub fn crossed(&self, trigger: Price, price: Price) -> bool {
        match self {
            TriggerCondition::Above => price >= trigger,
            TriggerCondition::Below => price <= trigger,
        }
    }
}

// take profit fires when price moves in favor of the position
pub fn take_profit_condition(direction: Direction) -> TriggerCondition {
    match direction {
        Direction::Long => TriggerCondition::Above,
        Direction::Short => TriggerCondition::Below,
    }
}

// stop loss fires when price moves against the position
pub fn stop_loss_condition(direction: Direction) -> TriggerCondition {
    match direction {
        Direction::Long => TriggerCondition::Below,
        Direction::Short => TriggerCondition::Above,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetError {
    #[error("take profit {take_profit} is not on the profit side of {reference} for a {direction} position")]
    TakeProfitWrongSide {
        direction: Direction,
        take_profit: Price,
        reference: Price,
    },

    #[error("stop loss {stop_loss} is not on the loss side of {reference} for a {direction} position")]
    StopLossWrongSide {
        direction: Direction,
        stop_loss: Price,
        reference: Price,
    },
}

// 2.3: TP must sit strictly on the profitable side of the reference price,
// SL strictly on the losing side.
pub fn validate_targets(
    direction: Direction,
    reference: Price,
    take_profit: Option<Price>,
    stop_loss: Option<Price>,
) -> Result<(), TargetError> {
    if let Some(tp) = take_profit {
        let ok = match direction {
            Direction::Long => tp > reference,
            Direction::Short => tp < reference,
        };
        if !ok {
            return Err(TargetError::TakeProfitWrongSide {
                direction,
                take_profit: tp,
                reference,
            });
        }
    }
    if let Some(sl) = stop_loss {
        let ok = match direction {
            Direction::Long => sl < reference,
            Direction::Short => sl > reference,
        };
        if !ok {
            return Err(TargetError::StopLossWrongSide {
                direction,
                stop_loss: sl,
                reference,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn px(v: Decimal) -> Price {
        Price::new_unchecked(v)
    }

    fn position(direction: Direction, tp: Option<Decimal>, sl: Option<Decimal>) -> Position {
        Position::new(
            PositionId(1),
            EntryId(1),
            Symbol::from("EURUSD"),
            direction,
            dec!(0.5),
            px(dec!(1.1000)),
            tp.map(px),
            sl.map(px),
            Timestamp::from_millis(0),
        )
    }

    #[test]
    fn long_triggers() {
        let pos = position(Direction::Long, Some(dec!(1.1050)), Some(dec!(1.0950)));
        assert_eq!(pos.check_trigger(px(dec!(1.1000))), None);
        assert_eq!(pos.check_trigger(px(dec!(1.1050))), Some(CloseReason::TakeProfit));
        assert_eq!(pos.check_trigger(px(dec!(1.0950))), Some(CloseReason::StopLoss));
    }

    #[test]
    fn short_triggers_are_mirrored() {
        let pos = position(Direction::Short, Some(dec!(1.0950)), Some(dec!(1.1050)));
        assert_eq!(pos.check_trigger(px(dec!(1.0949))), Some(CloseReason::TakeProfit));
        assert_eq!(pos.check_trigger(px(dec!(1.1051))), Some(CloseReason::StopLoss));
        assert_eq!(pos.check_trigger(px(dec!(1.1000))), None);
    }

    #[test]
    fn take_profit_wins_when_both_hit() {
        // inverted levels can only come from a bad edit path, but the
        // tie rule must still be stable
        let mut pos = position(Direction::Long, Some(dec!(1.1010)), None);
        pos.stop_loss = Some(px(dec!(1.1020)));
        assert_eq!(pos.check_trigger(px(dec!(1.1015))), Some(CloseReason::TakeProfit));
    }

    #[test]
    fn no_targets_never_trigger() {
        let pos = position(Direction::Long, None, None);
        assert!(!pos.has_targets());
        assert_eq!(pos.check_trigger(px(dec!(5))), None);
    }

    #[test]
    fn target_sides() {
        let reference = px(dec!(1.2500));
        assert!(validate_targets(Direction::Long, reference, Some(px(dec!(1.26))), Some(px(dec!(1.24)))).is_ok());
        assert!(validate_targets(Direction::Short, reference, Some(px(dec!(1.24))), Some(px(dec!(1.26)))).is_ok());

        assert!(matches!(
            validate_targets(Direction::Long, reference, Some(px(dec!(1.24))), None),
            Err(TargetError::TakeProfitWrongSide { .. })
        ));
        assert!(matches!(
            validate_targets(Direction::Short, reference, None, Some(px(dec!(1.24)))),
            Err(TargetError::StopLossWrongSide { .. })
        ));
        // equal to the reference is not on either side
        assert!(validate_targets(Direction::Long, reference, Some(reference), None).is_err());
    }

    #[test]
    fn close_reason_wire_names() {
        assert_eq!(serde_json::to_string(&CloseReason::TakeProfit).unwrap(), "\"TP_hit\"");
        assert_eq!(serde_json::to_string(&CloseReason::ForcedEndOfDay).unwrap(), "\"forced_eod\"");
        assert_eq!(CloseReason::StopLoss.to_string(), "SL_hit");
    }
}
