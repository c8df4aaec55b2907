mod support;

mod stream;
mod writer;
