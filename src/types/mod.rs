pub mod aggregation;
pub mod ids;
pub mod observation;
pub mod price;
pub mod timestamp;
