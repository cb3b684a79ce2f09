mod analysis_window;
mod baseline;
mod local_sample;
mod measurement;
mod tracked_target;

pub use analysis_window::AnalysisWindow;
pub use baseline::Baseline;
pub use local_sample::LocalNetworkSample;
pub use measurement::Measurement;
pub use tracked_target::TrackedTarget;
