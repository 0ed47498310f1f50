pub mod anomalies;
pub mod shops;
pub mod training_data;

pub use anomalies::AnomaliesRepository;
pub use shops::ShopsRepository;
pub use training_data::TrainingDataRepository;
