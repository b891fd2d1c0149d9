//! Hash tree tests

mod bucket_tests;
