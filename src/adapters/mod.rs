pub mod journal;
pub mod telegram;

pub use journal::{
    spawn_journal, JournalHandle, JournalSink, JsonlJournal, TracingJournal, TradeRecord,
};
pub use telegram::TelegramNotifier;
