pub mod uhci;
