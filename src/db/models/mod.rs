pub mod anomaly_models;
pub mod shop_models;
pub mod training_models;

pub use anomaly_models::{AnomalyEvent, AnomalySeverity, AnomalyStatus};
pub use shop_models::Shop;
pub use training_models::{TrainingSample, UserFeedback};
