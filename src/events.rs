// 11.0: every state change produces an event. used for the audit trail and for
// pushing to the notification layer. the EventPayload enum lists all event types.
// live updates go out on the bus only; everything else is also kept in the audit log.

use crate::position::CloseReason;
use crate::types::{Direction, EntryId, Level, PositionId, Price, Quote, Symbol, Timestamp, UserId};
use crate::valuation::EntryValuation;
use chrono::NaiveDate;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: Timestamp,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(id: EventId, timestamp: Timestamp, payload: EventPayload) -> Self {
        Self {
            id,
            timestamp,
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum EventPayload {
    // Entry events
    EntryRegistered(EntryRegisteredEvent),
    EntryConfirmed(EntryConfirmedEvent),

    // Position events
    PositionOpened(PositionOpenedEvent),
    PositionEdited(PositionEditedEvent),
    PositionClosed(PositionClosedEvent),
    TradeClosedAuto(TradeClosedAutoEvent),

    // Valuation snapshot, once per broadcast cycle
    LiveUpdate(LiveUpdateEvent),

    // Settlement events
    CapitalReset(CapitalResetEvent),
    PayoutCreated(PayoutEvent),
    CompetitionEnded(CompetitionEndedEvent),
    CandlesPruned(CandlesPrunedEvent),
}

impl EventPayload {
    // high-frequency payloads that are not worth keeping in the audit log
    pub fn is_transient(&self) -> bool {
        matches!(self, EventPayload::LiveUpdate(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryRegisteredEvent {
    pub entry_id: EntryId,
    pub user_id: UserId,
    pub level: Level,
    pub initial_capital: Quote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryConfirmedEvent {
    pub entry_id: EntryId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionOpenedEvent {
    pub position_id: PositionId,
    pub entry_id: EntryId,
    pub symbol: Symbol,
    pub direction: Direction,
    pub lot_size: Decimal,
    pub entry_price: Price,
    pub take_profit: Option<Price>,
    pub stop_loss: Option<Price>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionEditedEvent {
    pub position_id: PositionId,
    pub entry_id: EntryId,
    pub old_lot_size: Decimal,
    pub new_lot_size: Decimal,
    pub take_profit: Option<Price>,
    pub stop_loss: Option<Price>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionClosedEvent {
    pub position_id: PositionId,
    pub entry_id: EntryId,
    pub exit_price: Price,
    pub pnl_percent: Decimal,
    pub pnl_amount: Quote,
    pub capital_after: Quote,
    pub close_reason: CloseReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeClosedAutoEvent {
    pub position_id: PositionId,
    pub entry_id: EntryId,
    pub user_id: UserId,
    pub symbol: Symbol,
    pub reason: CloseReason,
    pub pnl_percent: Decimal,
    pub pnl_amount: Quote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveUpdateEvent {
    pub entries: Vec<EntryValuation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapitalResetEvent {
    pub entry_id: EntryId,
    pub level: Level,
    pub capital: Quote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutEvent {
    pub user_id: UserId,
    pub entry_id: EntryId,
    pub level: Level,
    pub position: u32,
    pub amount: Quote,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedEntry {
    pub rank: u32,
    pub entry_id: EntryId,
    pub user_id: UserId,
    pub final_capital: Quote,
    pub return_percent: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompetitionEndedEvent {
    pub level: Level,
    pub date: NaiveDate,
    pub participants: usize,
    pub rolled_over: bool,
    pub prize_pool: Quote,
    pub ranking: Vec<RankedEntry>,
    pub winners: Vec<PayoutEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandlesPrunedEvent {
    pub before: NaiveDate,
    pub removed: usize,
}

#[derive(Debug)]
struct EventLog {
    events: VecDeque<Event>,
    next_id: u64,
    max_events: usize,
}

/// Numbers events, keeps the bounded audit log and fans events out to
/// subscribers. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBus {
    log: Arc<Mutex<EventLog>>,
    tx: broadcast::Sender<Arc<Event>>,
}

impl EventBus {
    pub fn new(max_events: usize) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            log: Arc::new(Mutex::new(EventLog {
                events: VecDeque::new(),
                next_id: 1,
                max_events,
            })),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Event>> {
        self.tx.subscribe()
    }

    pub fn emit(&self, timestamp: Timestamp, payload: EventPayload) -> EventId {
        let event = {
            let mut log = self.log.lock();
            let event = Event::new(EventId(log.next_id), timestamp, payload);
            log.next_id += 1;

            if !event.payload.is_transient() {
                log.events.push_back(event.clone());
                while log.events.len() > log.max_events {
                    log.events.pop_front();
                }
            }
            event
        };

        let id = event.id;
        // no subscribers is fine
        let _ = self.tx.send(Arc::new(event));
        id
    }

    pub fn recent(&self, count: usize) -> Vec<Event> {
        let log = self.log.lock();
        let start = log.events.len().saturating_sub(count);
        log.events.iter().skip(start).cloned().collect()
    }

    pub fn events(&self) -> Vec<Event> {
        self.log.lock().events.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.log.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.lock().events.is_empty()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(100_000)
    }
}
