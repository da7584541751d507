pub mod font;
pub mod overlay;
pub mod preview;
pub mod slots;
pub mod state;
pub mod stats;

pub use overlay::OverlayLine;
pub use preview::{preview_channel, PreviewFrame, PreviewReceiver, PreviewSender};
pub use slots::{Outputs, SlotContext, SlotPipeline};
pub use state::{CameraState, ExperimentMeta, SharedState};
pub use stats::{PipelineStats, StatsSnapshot};
