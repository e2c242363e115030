use tokio::sync::watch;

use crate::message::{Attachment, Message};

/// Observable conversation state for one chat. The UI subscribes to watch
/// receivers; the session is the only writer while a generation is live.
///
/// History is append-only with a single exception: `replace_content` on the
/// assistant slot the session reserved at generation start. Nothing may
/// insert or remove elements before that index while a stream is running,
/// which keeps the reserved index trivially stable.
pub struct ChatStore {
    messages: watch::Sender<Vec<Message>>,
    live_answer: watch::Sender<String>,
    generating: watch::Sender<bool>,
    attachments: watch::Sender<Vec<Attachment>>,
}

impl ChatStore {
    pub fn new() -> Self {
        Self {
            messages: watch::Sender::new(Vec::new()),
            live_answer: watch::Sender::new(String::new()),
            generating: watch::Sender::new(false),
            attachments: watch::Sender::new(Vec::new()),
        }
    }

    // Subscriptions for the UI layer

    pub fn subscribe_messages(&self) -> watch::Receiver<Vec<Message>> {
        self.messages.subscribe()
    }

    pub fn subscribe_live_answer(&self) -> watch::Receiver<String> {
        self.live_answer.subscribe()
    }

    pub fn subscribe_generating(&self) -> watch::Receiver<bool> {
        self.generating.subscribe()
    }

    pub fn subscribe_attachments(&self) -> watch::Receiver<Vec<Attachment>> {
        self.attachments.subscribe()
    }

    // Snapshot reads

    pub fn messages(&self) -> Vec<Message> {
        self.messages.borrow().clone()
    }

    pub fn message_count(&self) -> usize {
        self.messages.borrow().len()
    }

    pub fn live_answer(&self) -> String {
        self.live_answer.borrow().clone()
    }

    pub fn is_generating(&self) -> bool {
        *self.generating.borrow()
    }

    pub fn attachments(&self) -> Vec<Attachment> {
        self.attachments.borrow().clone()
    }

    // History

    pub fn push_message(&self, msg: Message) {
        self.messages.send_modify(|list| list.push(msg));
    }

    /// Replace the content of the message at `idx`. Out-of-range indices
    /// are a silent no-op: a stale commit must never crash the UI layer.
    pub fn replace_content(&self, idx: usize, content: String) {
        self.messages.send_modify(|list| {
            if let Some(msg) = list.get_mut(idx) {
                msg.content = content;
            }
        });
    }

    // Ephemeral streaming state

    pub fn set_live_answer(&self, text: String) {
        self.live_answer.send_replace(text);
    }

    pub fn set_generating(&self, on: bool) {
        self.generating.send_replace(on);
    }

    // Attachments

    pub fn push_attachment(&self, att: Attachment) {
        self.attachments.send_modify(|list| list.push(att));
    }

    pub fn remove_attachment(&self, idx: usize) {
        self.attachments.send_modify(|list| {
            if idx < list.len() {
                list.remove(idx);
            }
        });
    }

    /// Flip an attachment out of its loading state once content resolved.
    pub fn mark_attachment_loaded(&self, id: &str, preview: String) {
        self.attachments.send_modify(|list| {
            if let Some(att) = list.iter_mut().find(|a| a.id == id) {
                att.loading = false;
                att.preview = preview;
            }
        });
    }

    /// Drain the pending attachments into the message being sent.
    pub fn take_attachments(&self) -> Vec<Attachment> {
        let mut taken = Vec::new();
        self.attachments.send_modify(|list| {
            taken = std::mem::take(list);
        });
        taken
    }
}

impl Default for ChatStore {
    fn default() -> Self {
        Self::new()
    }
}
