//! # notify::render
//!
//! Turns events into [`Message`]s.  One full message per event, plus compact
//! one-line headlines used when several events are grouped or a quiet-hours
//! digest is flushed.

use chrono::{DateTime, Utc};

use crate::models::{Event, EventBody, FieldChange, LevelKind, ModifiedField, Priority, Recurrence, Side};
use crate::notify::Message;

fn time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn opt(value: Option<f64>) -> String {
    value.map_or_else(|| "none".to_string(), |v| v.to_string())
}

fn profit_line(profit: f64) -> String {
    let emoji = if profit >= 0.0 { "💰" } else { "📉" };
    format!("Profit: {emoji} {profit:.2}")
}

fn change_line(change: &FieldChange) -> String {
    let label = match change.field {
        ModifiedField::StopLoss => "SL",
        ModifiedField::TakeProfit => "TP",
        ModifiedField::Volume => "Volume",
    };
    format!("{label}: {} → {}", opt(change.old), opt(change.new))
}

fn direction(kind: LevelKind) -> &'static str {
    match kind {
        LevelKind::Above => "crossed above",
        LevelKind::Below => "crossed below",
        LevelKind::Both => "crossed",
    }
}

/// Full message for one event.
pub fn render(event: &Event) -> Message {
    let (title, mut lines): (String, Vec<String>) = match &event.body {
        EventBody::PositionOpened { position: p, from_order } => {
            let emoji = if p.side == Side::Buy { "🟢" } else { "🔵" };
            let mut lines = vec![
                format!("Ticket: {}", p.ticket),
                format!("Symbol: {}", p.symbol),
                format!("Volume: {}", p.volume),
                format!("Open Price: {}", p.open_price),
            ];
            if p.stop_loss.is_some() || p.take_profit.is_some() {
                lines.push(format!("SL: {} | TP: {}", opt(p.stop_loss), opt(p.take_profit)));
            }
            if let Some(order) = from_order {
                lines.push(format!("Filled from order #{order}"));
            }
            (format!("{emoji} Trade OPENED ({})", p.side.as_str()), lines)
        }
        EventBody::PositionClosed { position: p, by_request } => {
            let mut lines = vec![
                format!("Ticket: {}", p.ticket),
                format!("Symbol: {}", p.symbol),
                format!("Type: {}", p.side.as_str()),
                format!("Volume: {}", p.volume),
                format!("Open Price: {}", p.open_price),
                format!("Last Price: {}", p.current_price),
                profit_line(p.profit),
            ];
            if *by_request {
                lines.push("Closed on request".to_string());
            }
            ("🔴 Trade CLOSED".to_string(), lines)
        }
        EventBody::PositionModified { position: p, changes } => {
            let mut lines = vec![format!("Ticket: {}", p.ticket), format!("Symbol: {}", p.symbol)];
            lines.extend(changes.iter().map(change_line));
            ("✏️ Trade MODIFIED".to_string(), lines)
        }
        EventBody::OrderPlaced { order: o }
        | EventBody::OrderFilled { order: o, .. }
        | EventBody::OrderExpired { order: o }
        | EventBody::OrderCancelled { order: o } => {
            let title = match &event.body {
                EventBody::OrderPlaced { .. } => "📋 Order PLACED",
                EventBody::OrderFilled { .. } => "✅ Order FILLED",
                EventBody::OrderExpired { .. } => "⌛ Order EXPIRED",
                _ => "❌ Order CANCELLED",
            };
            let mut lines = vec![
                format!("Ticket: {}", o.ticket),
                format!("Symbol: {}", o.symbol),
                format!("Type: {}", o.order_type.label()),
                format!("Volume: {}", o.volume),
                format!("Price: {}", o.price),
                format!("Setup Time: {}", time(o.setup_time)),
            ];
            if let Some(exp) = o.expiration {
                lines.push(format!("Expiration: {}", time(exp)));
            }
            if let EventBody::OrderFilled { position_ticket, .. } = &event.body {
                lines.push(format!("Position: #{position_ticket}"));
            }
            (title.to_string(), lines)
        }
        EventBody::PriceLevelTriggered { trigger: t } => {
            let mut lines = vec![
                format!("Symbol: {}", t.key.symbol),
                format!("Level ID: {}", t.key.id),
                format!("Description: {}", t.description),
                format!("Target Price: {}", t.target),
                format!("Current Price: {}", t.price),
                format!("Direction: {}", direction(t.kind)),
            ];
            if t.recurrence == Recurrence::Recurring && t.times_fired > 1 {
                lines.push(format!("Triggered {} times", t.times_fired));
            }
            ("🎯 Price Level Reached".to_string(), lines)
        }
        EventBody::PriceLevelExpired { key, target, description } => (
            "⌛ Price Level Expired".to_string(),
            vec![
                format!("Symbol: {}", key.symbol),
                format!("Level ID: {}", key.id),
                format!("Description: {description}"),
                format!("Target Price: {target}"),
            ],
        ),
        EventBody::RiskWarning { message, .. } => ("🛡️ Risk Warning".to_string(), vec![message.clone()]),
        EventBody::ProfitSuggestion { suggestion: s } => {
            let mut lines = vec![
                format!("Ticket: {}", s.ticket),
                format!("Symbol: {} ({})", s.symbol, s.side.as_str()),
                profit_line(s.profit),
                format!("Move: {:.2}%", s.profit_pct),
                format!("Consider closing {} of {} lots", s.volume_to_close, s.volume),
            ];
            if let Some(rec) = &s.recommendation {
                lines.push(format!("Advisor: {rec}"));
            }
            ("💡 Profit Suggestion".to_string(), lines)
        }
        EventBody::ConnectionRestored { failed_cycles } => (
            "🔌 Connection Restored".to_string(),
            vec![format!("Terminal reachable again after {failed_cycles} failed polls")],
        ),
        EventBody::AlertsSuppressed { category, count } => (
            "🔇 Alerts Suppressed".to_string(),
            vec![format!("{count} {} alerts were rate limited", category.as_str())],
        ),
        EventBody::CommandResult { command, ok, message, .. } => (
            format!("🛠️ Command {}", if *ok { "DONE" } else { "FAILED" }),
            vec![format!("Command: {command}"), message.clone()],
        ),
    };

    lines.push(format!("Time: {}", time(event.at)));
    Message { title, lines, priority: event.priority() }
}

/// One-line summary used inside grouped messages and digests.
pub fn headline(event: &Event) -> String {
    match &event.body {
        EventBody::PositionOpened { position: p, .. } => {
            format!("{} #{} {} {} @ {}", p.symbol, p.ticket, p.side.as_str(), p.volume, p.open_price)
        }
        EventBody::PositionClosed { position: p, .. } => {
            format!("{} #{} {} {} profit {:.2}", p.symbol, p.ticket, p.side.as_str(), p.volume, p.profit)
        }
        EventBody::PositionModified { position: p, changes } => {
            let fields: Vec<String> = changes.iter().map(change_line).collect();
            format!("{} #{} {}", p.symbol, p.ticket, fields.join(", "))
        }
        EventBody::OrderPlaced { order: o }
        | EventBody::OrderFilled { order: o, .. }
        | EventBody::OrderExpired { order: o }
        | EventBody::OrderCancelled { order: o } => {
            format!("{} #{} {} {} @ {}", o.symbol, o.ticket, o.order_type.label(), o.volume, o.price)
        }
        EventBody::PriceLevelTriggered { trigger: t } => {
            format!("{} {} {} at {}", t.key, direction(t.kind), t.target, t.price)
        }
        _ => {
            let message = render(event);
            match message.lines.first() {
                Some(first) => format!("{}: {first}", message.title),
                None => message.title,
            }
        }
    }
}

/// Several same-kind events for different symbols in one message.
pub fn render_group(events: &[Event]) -> Message {
    let first = render(&events[0]);
    let mut symbols: Vec<&str> = events.iter().filter_map(Event::symbol).collect();
    symbols.sort_unstable();
    symbols.dedup();

    Message {
        title:    format!("{} ×{} ({})", first.title, events.len(), symbols.join(", ")),
        lines:    events.iter().map(|e| format!("• {}", headline(e))).collect(),
        priority: events.iter().map(Event::priority).max().unwrap_or(Priority::Normal),
    }
}

/// Alerts held back during quiet hours, flushed as one message.
pub fn render_digest(events: &[Event]) -> Message {
    let mut lines: Vec<String> = events
        .iter()
        .map(|e| format!("• {} {}", e.at.format("%H:%M"), headline(e)))
        .collect();
    lines.push(format!("{} alerts held during quiet hours", events.len()));

    Message {
        title:    "🌅 Quiet Hours Digest".to_string(),
        lines,
        priority: events.iter().map(Event::priority).max().unwrap_or(Priority::Normal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::differ::tests::{order, position, t0};
    use crate::models::OrderType;

    #[test]
    fn test_closed_message_has_profit_and_priority() {
        let mut p = position(5, "EURUSD", Side::Buy, 0.1, 1.1);
        p.profit = -12.5;
        let msg = render(&Event::new(t0(), EventBody::PositionClosed { position: p, by_request: true }));

        assert_eq!(msg.title, "🔴 Trade CLOSED");
        assert!(msg.lines.contains(&"Profit: 📉 -12.50".to_string()));
        assert!(msg.lines.contains(&"Closed on request".to_string()));
        assert_eq!(msg.priority, Priority::Important);
        assert_eq!(msg.lines.last().unwrap(), "Time: 2025-03-03 12:00:00 UTC");
    }

    #[test]
    fn test_modified_lists_changes() {
        let msg = render(&Event::new(t0(), EventBody::PositionModified {
            position: position(5, "EURUSD", Side::Buy, 0.1, 1.1),
            changes:  vec![FieldChange { field: ModifiedField::TakeProfit, old: Some(1.12), new: None }],
        }));
        assert!(msg.lines.contains(&"TP: 1.12 → none".to_string()));
    }

    #[test]
    fn test_group_title_lists_symbols() {
        let events = vec![
            Event::new(t0(), EventBody::OrderPlaced { order: order(1, "EURUSD", OrderType::BuyLimit, 0.1, 1.09) }),
            Event::new(t0(), EventBody::OrderPlaced { order: order(2, "GBPUSD", OrderType::SellStop, 0.2, 1.25) }),
        ];
        let msg = render_group(&events);
        assert_eq!(msg.title, "📋 Order PLACED ×2 (EURUSD, GBPUSD)");
        assert_eq!(msg.lines.len(), 2);
        assert_eq!(msg.lines[1], "• GBPUSD #2 SELL STOP 0.2 @ 1.25");
    }
}
