mod caching;
mod rdma;
mod registry;
