//! Hook bus for host domain events.
//!
//! Hooks are named events the host fires at decision points. Extensions
//! register listeners; when an event fires, all listeners run in
//! registration order on their extension's scheduler worker, where they
//! may mutate the payload and call `preventDefault`. After dispatch the
//! host inspects the envelope to decide whether its default behavior
//! still runs.

mod events;
mod manager;

pub use events::{
    AnimeEntryFillerHydrationEvent, AnimeEntryRequestedEvent,
    AnimeLibraryCollectionRequestedEvent, HookEvent, LocalFilePlaybackRequestedEvent,
    MissingEpisodesRequestedEvent, ScanCompletedEvent, ScanStartedEvent,
};
pub use manager::{Dispatched, HookEnvelope, HookManager};
