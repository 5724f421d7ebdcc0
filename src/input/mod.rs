mod metainfo;

pub use metainfo::Metainfo;
