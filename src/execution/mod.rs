pub mod optimizer;
pub mod pipeline;
pub mod router;
pub mod signer;

pub use optimizer::HttpOptimizer;
pub use pipeline::{ConfirmationOutcome, TxSkeleton};
pub use router::{
    AccountTier, ConfirmationSettings, DeliveryContext, DeliveryRouter, FeePolicy, PriorityClass,
    Route, RoutingPolicy, TransactionType,
};
pub use signer::KeypairSigner;
