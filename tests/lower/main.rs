
mod blocks;
mod calls;
mod controlflow;
mod literals;
mod unions;
