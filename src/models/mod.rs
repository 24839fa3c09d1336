pub mod detector;
pub mod trunk;
pub mod yolo;
