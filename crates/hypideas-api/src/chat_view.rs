//! State behind one open conversation or channel: the message timeline,
//! who is typing, and message reactions, kept current from the change feed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use hypideas_backend::Backend;
use hypideas_realtime::{ChangeFeed, ChangeFilter, RealtimeError, SubscriptionSlot};
use hypideas_state::reactions::ReactionTally;
use hypideas_state::timeline::{DisplayRow, PageCursor, Timeline, TimelineChange};
use hypideas_state::typing::{TypingDebouncer, TypingSignal, TypingTracker};
use hypideas_types::ValidationError;
use hypideas_types::api::{MESSAGE_PAGE_SIZE, NewMessage};
use hypideas_types::events::{ChangeEvent, RawChange};
use hypideas_types::models::{ChatTarget, Message, MessageReaction, TypingIndicator};

use crate::{Api, Result};

/// Identifies a page request made for one generation of the view. A page
/// that comes back after the view was retargeted or closed is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTicket {
    generation: u64,
    target: ChatTarget,
    before: Option<PageCursor>,
}

impl PageTicket {
    pub fn target(&self) -> ChatTarget {
        self.target
    }
}

#[derive(Debug, Clone)]
pub struct PageResult {
    ticket: PageTicket,
    messages: Vec<Message>,
    reactions: HashMap<Uuid, ReactionTally<String>>,
}

/// What a change did to the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewUpdate {
    Timeline(TimelineChange),
    Typing,
    Reaction(Uuid),
    Ignored,
}

/// Load one page of messages and their reactions. Independent of the view
/// so it can run while the view keeps handling changes.
pub async fn fetch_page<B: Backend>(api: &Api<B>, ticket: PageTicket) -> Result<PageResult> {
    let messages = api
        .fetch_messages(ticket.target, ticket.before, MESSAGE_PAGE_SIZE)
        .await?;
    let ids: Vec<Uuid> = messages.iter().map(|m| m.id).collect();
    let reactions = api.message_reactions(&ids).await?;
    Ok(PageResult {
        ticket,
        messages,
        reactions,
    })
}

pub struct ChatView<B, F> {
    api: Api<B>,
    feed: Arc<F>,
    slot: SubscriptionSlot,
    target: Option<ChatTarget>,
    generation: u64,
    timeline: Timeline,
    typing: TypingTracker,
    debouncer: TypingDebouncer,
    reactions: HashMap<Uuid, ReactionTally<String>>,
    exhausted: bool,
}

impl<B: Backend, F: ChangeFeed> ChatView<B, F> {
    pub fn new(api: Api<B>, feed: Arc<F>) -> Self {
        let me = api.me().id;
        Self {
            api,
            feed,
            slot: SubscriptionSlot::new(),
            target: None,
            generation: 0,
            timeline: Timeline::new(),
            typing: TypingTracker::new(me),
            debouncer: TypingDebouncer::new(),
            reactions: HashMap::new(),
            exhausted: false,
        }
    }

    /// Switch to `target`. The previous subscription is released before
    /// the new one is made, and pages still in flight for the previous
    /// target are invalidated. Returns the ticket for the first page.
    pub fn open(&mut self, target: ChatTarget) -> std::result::Result<PageTicket, RealtimeError> {
        self.reset();
        self.target = Some(target);

        let (column, id) = (target.column(), target.id());
        let filters = vec![
            ChangeFilter::table("messages").column_eq(column, id),
            ChangeFilter::table("typing_indicators").column_eq(column, id),
            // Reactions carry no chat column; they are matched against
            // known messages on arrival.
            ChangeFilter::table("message_reactions"),
        ];
        self.slot.replace(self.feed.as_ref(), &target.topic(), filters)?;
        info!("Opened {}", target.topic());

        Ok(PageTicket {
            generation: self.generation,
            target,
            before: None,
        })
    }

    pub fn close(&mut self) {
        if let Some(target) = self.target {
            debug!("Closing {}", target.topic());
        }
        self.reset();
    }

    fn reset(&mut self) {
        self.slot.release();
        self.generation += 1;
        self.target = None;
        self.timeline.clear();
        self.typing.clear();
        self.debouncer.reset();
        self.reactions.clear();
        self.exhausted = false;
    }

    /// Ticket for the page before the oldest loaded message, or `None` when
    /// nothing is open or the history is fully loaded.
    pub fn next_page_ticket(&self) -> Option<PageTicket> {
        let target = self.target?;
        if self.exhausted {
            return None;
        }
        Some(PageTicket {
            generation: self.generation,
            target,
            before: self.timeline.oldest(),
        })
    }

    /// Merge a fetched page. Returns false when the page belongs to an
    /// earlier generation and was dropped.
    pub fn apply_page(&mut self, page: PageResult) -> bool {
        let ticket = page.ticket;
        if ticket.generation != self.generation || self.target != Some(ticket.target) {
            warn!(
                "Discarding stale page for {} (generation {} != {})",
                ticket.target.topic(),
                ticket.generation,
                self.generation
            );
            return false;
        }

        if page.messages.len() < MESSAGE_PAGE_SIZE {
            self.exhausted = true;
        }
        // Tallies already built from live events are newer than the page.
        for (id, tally) in page.reactions {
            self.reactions.entry(id).or_insert(tally);
        }
        let added = self.timeline.merge_page(page.messages);
        debug!("Merged {} messages into {}", added, ticket.target.topic());
        true
    }

    /// Fetch and merge the next older page. Returns how many messages the
    /// timeline now holds.
    pub async fn load_older(&mut self) -> Result<usize> {
        let Some(ticket) = self.next_page_ticket() else {
            return Ok(self.timeline.len());
        };
        let page = fetch_page(&self.api, ticket).await?;
        self.apply_page(page);
        Ok(self.timeline.len())
    }

    pub fn handle_change(&mut self, change: RawChange) -> ViewUpdate {
        let Some(target) = self.target else {
            return ViewUpdate::Ignored;
        };
        match change.table.as_str() {
            "messages" => match change.decode::<Message>() {
                Ok(ChangeEvent::Insert(m) | ChangeEvent::Update(m)) if m.target != target => ViewUpdate::Ignored,
                Ok(event) => ViewUpdate::Timeline(self.timeline.apply(event)),
                Err(e) => {
                    warn!("Ignoring malformed message change: {}", e);
                    ViewUpdate::Ignored
                }
            },
            "typing_indicators" => match change.decode::<TypingIndicator>() {
                Ok(ChangeEvent::Insert(t) | ChangeEvent::Update(t)) if t.target != target => ViewUpdate::Ignored,
                Ok(ChangeEvent::Delete(key)) if key.names_other_chat(target) => ViewUpdate::Ignored,
                Ok(event) => {
                    self.typing.apply(event);
                    ViewUpdate::Typing
                }
                Err(e) => {
                    warn!("Ignoring malformed typing change: {}", e);
                    ViewUpdate::Ignored
                }
            },
            "message_reactions" => {
                let (reaction, present) = match change.decode::<MessageReaction>() {
                    Ok(ChangeEvent::Insert(r)) => (r, true),
                    Ok(ChangeEvent::Delete(r)) => (r, false),
                    Ok(ChangeEvent::Update(_)) => return ViewUpdate::Ignored,
                    Err(e) => {
                        warn!("Ignoring malformed reaction change: {}", e);
                        return ViewUpdate::Ignored;
                    }
                };
                if !self.timeline.contains(reaction.message_id) {
                    return ViewUpdate::Ignored;
                }
                let me = self.api.me().id;
                let changed = self
                    .reactions
                    .entry(reaction.message_id)
                    .or_insert_with(|| ReactionTally::new(me))
                    .apply(reaction.user_id, reaction.reaction_type, present);
                if changed {
                    ViewUpdate::Reaction(reaction.message_id)
                } else {
                    ViewUpdate::Ignored
                }
            }
            other => {
                debug!("No handler for {} changes", other);
                ViewUpdate::Ignored
            }
        }
    }

    /// Apply every change already delivered, without waiting.
    pub fn drain(&mut self) -> Vec<ViewUpdate> {
        let mut updates = Vec::new();
        while let Some(change) = self.slot.current().and_then(|sub| sub.try_recv()) {
            updates.push(self.handle_change(change));
        }
        updates
    }

    /// Wait for the next change and apply it. `None` once the view is
    /// closed or the feed has ended.
    pub async fn next_change(&mut self) -> Option<ViewUpdate> {
        let change = self.slot.current()?.recv().await?;
        Some(self.handle_change(change))
    }

    /// Send a text message. It is shown at once; the echo from the change
    /// feed collapses into the same entry.
    pub async fn send(&mut self, content: &str, reply_to: Option<Uuid>) -> Result<Message> {
        let target = self.target.ok_or(ValidationError::Required("conversation"))?;
        let message = self
            .api
            .send_message(NewMessage {
                target,
                content: content.to_string(),
                reply_to_message_id: reply_to,
            })
            .await?;
        if self.target == Some(target) {
            self.timeline.apply(ChangeEvent::Insert(message.clone()));
        }
        if let Some(TypingSignal::Stop) = self.debouncer.on_send() {
            self.signal_typing(target, false).await;
        }
        Ok(message)
    }

    pub async fn toggle_reaction(&mut self, message_id: Uuid, emoji: &str) -> Result<bool> {
        let me = self.api.me().id;
        let active = self
            .reactions
            .get(&message_id)
            .is_some_and(|t| t.is_active(&emoji.to_string()));
        if active {
            self.api.remove_message_reaction(message_id, emoji).await?;
        } else {
            self.api.add_message_reaction(message_id, emoji).await?;
        }
        self.reactions
            .entry(message_id)
            .or_insert_with(|| ReactionTally::new(me))
            .apply(me, emoji.to_string(), !active);
        Ok(!active)
    }

    /// Record a keystroke in the composer.
    pub async fn keystroke(&mut self) {
        let Some(target) = self.target else { return };
        if let Some(signal) = self.debouncer.on_keystroke(Instant::now()) {
            self.signal_typing(target, signal == TypingSignal::Start).await;
        }
    }

    /// Periodic housekeeping: expire remote typers and stop announcing our
    /// own typing once the composer goes idle.
    pub async fn tick(&mut self) {
        self.typing.prune(Utc::now());
        let Some(target) = self.target else { return };
        if let Some(TypingSignal::Stop) = self.debouncer.poll(Instant::now()) {
            self.signal_typing(target, false).await;
        }
    }

    async fn signal_typing(&self, target: ChatTarget, typing: bool) {
        if let Err(e) = self.api.set_typing(target, typing).await {
            warn!("Typing update for {} failed: {}", target.topic(), e);
        }
    }

    pub fn target(&self) -> Option<ChatTarget> {
        self.target
    }

    pub fn api(&self) -> &Api<B> {
        &self.api
    }

    pub fn messages(&self) -> &[Message] {
        self.timeline.messages()
    }

    pub fn display_rows(&self) -> Vec<DisplayRow<'_>> {
        self.timeline.display_rows(self.api.me().id)
    }

    pub fn reactions_for(&self, message_id: Uuid) -> Option<&ReactionTally<String>> {
        self.reactions.get(&message_id)
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn is_subscribed(&self) -> bool {
        self.slot.is_active()
    }

    /// Typing line using author names seen in the timeline.
    pub fn typing_summary(&self, now: DateTime<Utc>) -> Option<String> {
        self.typing.summary(now, |user| {
            self.timeline
                .messages()
                .iter()
                .rev()
                .find_map(|m| m.author.as_ref().filter(|a| a.id == user))
                .map_or_else(|| "Someone".to_string(), |a| a.label().to_string())
        })
    }
}
