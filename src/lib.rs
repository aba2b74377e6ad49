pub mod index_service;
pub mod collections;
pub mod data_layer_error;
pub mod metadata_svc;
pub mod timestamp_svc;
pub mod tree_node;
pub mod config;
