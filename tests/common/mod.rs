pub(crate) mod builders;

pub(crate) mod logging;

pub(crate) mod mem_store;
