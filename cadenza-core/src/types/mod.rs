pub mod ids;
pub mod track;

pub use ids::{ArtistId, JobId, TrackId, TrackUniqueId};
pub use track::{
    ExternalTrackRefs, NewTrackRecord, TrackArtifactSet, TrackRecord,
    TrackSubmission,
};
