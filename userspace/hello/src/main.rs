#![no_std]
#![no_main]

use ulib::env::thisenv;
use ulib::println;

#[unsafe(no_mangle)]
pub extern "C" fn umain() {
    println!("hello, world");
    println!("i am environment {:08x}", thisenv().env_id);
}
