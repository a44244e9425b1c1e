extern crate bit_field;
extern crate libc;


pub mod c_interface;
pub mod gc;
pub mod marking;
pub mod pages;
