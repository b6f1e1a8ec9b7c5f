pub mod category_reader;
pub mod category_writer;
