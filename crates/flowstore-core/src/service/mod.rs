// Cluster services: mastership, replica resolution and messaging

pub mod local_fabric;
pub mod mastership;
pub mod messenger;
pub mod replica;
