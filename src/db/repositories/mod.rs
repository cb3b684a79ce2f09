mod analysis;
mod baselines;
mod local_metrics;
mod measurements;
mod tracked_targets;
