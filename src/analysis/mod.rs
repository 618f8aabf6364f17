/// Pure series transforms used by the pipeline stages.
///
/// Every function here takes series by reference and returns new series; none
/// of them log or touch the provider.
///
/// Submodules:
/// - `cleaning`   — outlier clamping, jump detection, offsets.
/// - `regular`    — regularization onto a grid and gap interpolation.
/// - `fill`       — rolling mean and the fill-from-other cascade step.
/// - `regression` — OLS calibration and fixed linear combination.

pub mod cleaning;
pub mod fill;
pub mod regression;
pub mod regular;
