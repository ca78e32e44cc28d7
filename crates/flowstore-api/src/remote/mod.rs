// Cluster message contracts exchanged between flowstore nodes

pub mod model;
