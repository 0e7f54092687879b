#![allow(dead_code)]

pub mod packages;
