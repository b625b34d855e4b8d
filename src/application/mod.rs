pub mod dispatcher;
pub mod fields;
pub mod reconcile;
pub mod routing;
pub mod shaper;
pub mod shapers;

pub use dispatcher::CdcDispatcher;
pub use reconcile::{Disposition, InboundAction, ReconcileError, Reconciler};
pub use shaper::{ShapeError, ShapedEvent, Shaper};
