pub mod blob_detector;
pub mod centroid;
pub mod frame;
pub mod scan_plane;
pub mod track;
pub mod tracker;
